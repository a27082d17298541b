//! Credentials, the singleflight refresh gate, and the request dispatcher
//! that ties them to every outbound call.

pub mod credentials;
pub mod dispatcher;
pub mod refresh;
