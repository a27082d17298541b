pub const MESSAGES_STREAM: &str = "/messages/stream";
pub const SESSIONS: &str = "/sessions/";
pub const FEEDBACK: &str = "/feedback/";

pub fn session(session_id: &str) -> String {
    format!("/sessions/{session_id}/")
}

pub fn generate_title(session_id: &str) -> String {
    format!("/sessions/{session_id}/generate_title/")
}

pub fn regenerate(message_id: &str) -> String {
    format!("/messages/{message_id}/regenerate/")
}
