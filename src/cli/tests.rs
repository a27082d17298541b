use super::*;
use crate::core::message::Participant;

#[test]
fn send_collects_text_and_parents() {
    let args = Args::try_parse_from([
        "arena-chat",
        "--no-keyring",
        "send",
        "--parent",
        "m1",
        "--parent",
        "m2",
        "s1",
        "tell",
        "me",
        "more",
    ])
    .unwrap();
    assert!(args.no_keyring);
    match args.command {
        Commands::Send {
            session,
            text,
            parents,
        } => {
            assert_eq!(session, "s1");
            assert_eq!(text.join(" "), "tell me more");
            assert_eq!(parents, vec!["m1", "m2"]);
        }
        _ => panic!("expected send"),
    }
}

#[test]
fn new_parses_mode_and_feedback_parses_preference() {
    let args = Args::try_parse_from([
        "arena-chat",
        "new",
        "--mode",
        "Compare",
        "--model-a",
        "m-a",
        "--model-b",
        "m-b",
    ])
    .unwrap();
    assert!(matches!(
        args.command,
        Commands::New {
            mode: ChatMode::Compare,
            ..
        }
    ));

    let args =
        Args::try_parse_from(["arena-chat", "feedback", "s1", "m1", "both_bad"]).unwrap();
    assert!(matches!(
        args.command,
        Commands::Feedback {
            preference: Preference::BothBad,
            ..
        }
    ));
    assert!(Args::try_parse_from(["arena-chat", "feedback", "s1", "m1", "meh"]).is_err());
}

#[test]
fn auth_requires_one_credential_kind() {
    assert!(Args::try_parse_from(["arena-chat", "auth"]).is_err());
    assert!(
        Args::try_parse_from(["arena-chat", "auth", "--access", "a", "--anonymous", "b"]).is_err()
    );
    assert!(Args::try_parse_from(["arena-chat", "auth", "--refresh", "r"]).is_err());
    assert!(Args::try_parse_from(["arena-chat", "auth", "--anonymous", "b"]).is_ok());
}

#[test]
fn stored_access_without_refresh_clears_the_old_refresh() {
    let credentials = CredentialStore::in_memory();
    credentials.set(CredentialKind::Refresh, "old").unwrap();
    store_credentials(
        &credentials,
        AuthArgs {
            access: Some("acc".to_string()),
            refresh: None,
            anonymous: None,
        },
    )
    .unwrap();
    assert_eq!(
        credentials.get(CredentialKind::Access).unwrap().as_deref(),
        Some("acc")
    );
    assert_eq!(credentials.get(CredentialKind::Refresh).unwrap(), None);
}

#[test]
fn latest_turn_follows_the_last_user_message() {
    let messages = vec![
        Message::user("u1", "first", Vec::new()),
        Message::placeholder("a1", Participant::A, vec!["u1".into()], None),
        Message::user("u2", "second", vec!["a1".into()]),
        Message::placeholder("a2", Participant::A, vec!["u2".into()], None),
        Message::placeholder("b2", Participant::B, vec!["u2".into()], None),
    ];
    assert_eq!(latest_turn_ids(&messages), vec!["a2", "b2"]);
    assert!(latest_turn_ids(&messages[..3]).is_empty());
    assert!(latest_turn_ids(&[]).is_empty());
}
