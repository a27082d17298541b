//! Command-line interface parsing and handling
//!
//! This module parses command-line arguments and runs one command against
//! the chat service per invocation.

#[cfg(test)]
mod tests;

use std::error::Error;

use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::credentials::{CredentialKind, CredentialStore};
use crate::core::client::{ChatClient, SendRequest};
use crate::core::config::Config;
use crate::core::message::{Message, Preference, Role};
use crate::core::notice::Notice;
use crate::core::session::ChatMode;
use crate::utils::logging::init_tracing;

#[derive(Parser)]
#[command(name = "arena-chat")]
#[command(about = "Chat with one or two models side by side")]
#[command(
    long_about = "Arena Chat talks to a chat comparison service. Each turn streams a response \
from one model (direct mode) or two models at once (compare and random modes).\n\n\
Environment Variables:\n\
  ARENA_CHAT_API_URL  Service base URL (overrides the config file)\n\
  ARENA_CHAT_LOG      Diagnostic log filter written to stderr (default: warn)\n\n\
Press Ctrl+C while a response is streaming to stop it."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Service base URL, e.g. http://localhost:8000/api
    #[arg(long, global = true, value_name = "URL")]
    pub base_url: Option<String>,

    /// Keep credentials in memory only instead of the system keyring
    #[arg(long, global = true)]
    pub no_keyring: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Store credentials for the service
    Auth(AuthArgs),
    /// Remove all stored credentials
    Deauth,
    /// List sessions
    Sessions,
    /// Create a session
    New {
        #[arg(long, default_value = "direct")]
        mode: ChatMode,
        #[arg(long, value_name = "MODEL_ID")]
        model_a: Option<String>,
        #[arg(long, value_name = "MODEL_ID")]
        model_b: Option<String>,
    },
    /// Send a message and stream the responses
    Send {
        session: String,
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
        /// Message this turn answers (defaults to the latest responses)
        #[arg(long = "parent", value_name = "MESSAGE_ID")]
        parents: Vec<String>,
    },
    /// Regenerate one assistant response in place
    Regenerate { session: String, message_id: String },
    /// Rename a session
    Rename {
        session: String,
        #[arg(required = true, trailing_var_arg = true)]
        title: Vec<String>,
    },
    /// Delete a session
    Delete { session: String },
    /// Record which response was better
    Feedback {
        session: String,
        message_id: String,
        preference: Preference,
    },
}

#[derive(ClapArgs)]
pub struct AuthArgs {
    /// Access credential of a signed-in user
    #[arg(long, conflicts_with = "anonymous", required_unless_present = "anonymous")]
    pub access: Option<String>,
    /// Refresh credential paired with --access
    #[arg(long, requires = "access")]
    pub refresh: Option<String>,
    /// Anonymous visitor credential
    #[arg(long)]
    pub anonymous: Option<String>,
}

pub fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let args = Args::parse();
    tokio::runtime::Runtime::new()?.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    let mut config = Config::load()?;
    if let Some(base_url) = args.base_url {
        config.base_url = base_url;
    }
    let credentials = CredentialStore::new_with_keyring(config.use_keyring && !args.no_keyring);

    match args.command {
        Commands::Auth(auth) => {
            store_credentials(&credentials, auth)?;
            println!("✅ Credentials saved");
            return Ok(());
        }
        Commands::Deauth => {
            credentials.clear()?;
            println!("✅ Credentials removed");
            return Ok(());
        }
        _ => {}
    }

    let (client, notices) = ChatClient::from_config(&config, credentials);
    let printer = tokio::spawn(print_notices(notices));
    let result = run_command(&client, args.command).await;
    drop(client);
    let _ = printer.await;
    result
}

fn store_credentials(credentials: &CredentialStore, auth: AuthArgs) -> Result<(), Box<dyn Error>> {
    if let Some(anonymous) = auth.anonymous {
        credentials.set(CredentialKind::Anonymous, &anonymous)?;
    }
    if let Some(access) = auth.access {
        credentials.set(CredentialKind::Access, &access)?;
        match auth.refresh {
            Some(refresh) => credentials.set(CredentialKind::Refresh, &refresh)?,
            None => {
                credentials.remove(CredentialKind::Refresh)?;
            }
        }
    }
    Ok(())
}

async fn run_command(client: &ChatClient, command: Commands) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Auth(_) | Commands::Deauth => Ok(()),
        Commands::Sessions => {
            let sessions = client.fetch_sessions().await?;
            if sessions.is_empty() {
                println!("No sessions yet. Create one with 'arena-chat new'.");
            }
            for session in sessions {
                println!("{}  [{}]  {}", session.id, session.mode, session.display_title());
            }
            Ok(())
        }
        Commands::New {
            mode,
            model_a,
            model_b,
        } => {
            let session = client
                .create_session(mode, model_a.as_deref(), model_b.as_deref())
                .await?;
            println!("✅ Created {} session {}", session.mode, session.id);
            Ok(())
        }
        Commands::Send {
            session,
            text,
            parents,
        } => {
            client.load_session(&session).await?;
            let parent_message_ids = if parents.is_empty() {
                latest_turn_ids(client.store().lock().await.messages(&session))
            } else {
                parents
            };
            let cancel = cancel_on_ctrl_c();
            let outcome = client
                .send_message(
                    SendRequest {
                        session_id: session.clone(),
                        content: text.join(" "),
                        parent_message_ids,
                    },
                    &cancel,
                )
                .await?;
            for message in &outcome.messages {
                print_message(message);
            }
            Ok(())
        }
        Commands::Regenerate {
            session,
            message_id,
        } => {
            client.load_session(&session).await?;
            let cancel = cancel_on_ctrl_c();
            let message = client.regenerate(&session, &message_id, &cancel).await?;
            print_message(&message);
            Ok(())
        }
        Commands::Rename { session, title } => {
            let title = title.join(" ");
            client.rename_session(&session, &title).await?;
            println!("✅ Renamed {session} to: {title}");
            Ok(())
        }
        Commands::Delete { session } => {
            client.delete_session(&session).await?;
            println!("✅ Deleted session {session}");
            Ok(())
        }
        Commands::Feedback {
            session,
            message_id,
            preference,
        } => {
            client.load_session(&session).await?;
            client
                .submit_feedback(&session, &message_id, preference)
                .await?;
            println!("✅ Recorded preference: {preference}");
            Ok(())
        }
    }
}

/// Assistant responses that follow the most recent user message.
fn latest_turn_ids(messages: &[Message]) -> Vec<String> {
    let start = messages
        .iter()
        .rposition(|message| message.role == Role::User)
        .map_or(0, |index| index + 1);
    messages[start..]
        .iter()
        .filter(|message| message.is_assistant())
        .map(|message| message.id.clone())
        .collect()
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

fn print_message(message: &Message) {
    let label = match message.participant {
        Some(participant) => format!("Model {}", participant.as_str().to_ascii_uppercase()),
        None => "Assistant".to_string(),
    };
    println!("── {label} ({}) ──", message.id);
    println!("{}", message.content);
}

async fn print_notices(mut notices: mpsc::UnboundedReceiver<Notice>) {
    while let Some(notice) = notices.recv().await {
        eprintln!("⚠️  {notice}");
    }
}
