//! Line-command parser for the interactive prompt.

use std::path::PathBuf;

use backend_core::{
    BackendCommand, DeleteScope, Gender, PasswordChange, ProfileUpdate, RegistrationForm,
};
use thiserror::Error;

pub const HELP: &str = "\
commands:
  /login <login> <password>        /register <user> <email> <password> <male|female>
  /restore                         /logout
  /profile [name=<user>] [gender=<male|female>]
  /password <old> <new> <confirm>
  /list                            /search <query>
  /start <peer_id>                 /open <conversation_id>   /close
  /hide <conversation_id>          /clear <conversation_id>
  /older                           /reload
  /attach <path>                   /detach <index>           /detach-all
  /edit <message_id> <text>        /delete <message_id> [me|all]
  /delete-file <message_id> <attachment_id> [me|all]
  /download <attachment_id>        /read [message_id]
  /publish <json>                  /help   /quit
any other line is sent to the open conversation (start with // to send a leading /)";

/// One parsed prompt line.
#[derive(Debug, Clone, PartialEq)]
pub enum CliAction {
    /// Commands forwarded to the runtime in order.
    Backend(Vec<BackendCommand>),
    /// Send text (plus staged files) to the open conversation.
    Send { text: String },
    /// Read a local file and stage it for the next send.
    Attach { path: PathBuf },
    /// Log in and remember the login name for startup restore.
    Login { login: String, password: String },
    Help,
    Quit,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown command '/{0}', try /help")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("'{value}' is not a valid {what}")]
    InvalidArgument { what: &'static str, value: String },
}

pub fn parse_line(line: &str) -> Result<CliAction, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(CliAction::Empty);
    }
    if let Some(escaped) = line.strip_prefix("//") {
        return Ok(CliAction::Send {
            text: format!("/{escaped}"),
        });
    }
    let Some(command_line) = line.strip_prefix('/') else {
        return Ok(CliAction::Send {
            text: line.to_owned(),
        });
    };

    let (name, rest) = split_word(command_line);
    let args: Vec<&str> = rest.split_whitespace().collect();
    let single = |command: BackendCommand| -> Result<CliAction, ParseError> {
        Ok(CliAction::Backend(vec![command]))
    };

    match name {
        "help" | "h" => Ok(CliAction::Help),
        "quit" | "q" | "exit" => Ok(CliAction::Quit),
        "login" => match args.as_slice() {
            [login, password] => Ok(CliAction::Login {
                login: (*login).to_owned(),
                password: (*password).to_owned(),
            }),
            _ => Err(ParseError::Usage("/login <login> <password>")),
        },
        "register" => match args.as_slice() {
            [username, email, password, gender] => {
                single(BackendCommand::Register(RegistrationForm {
                    username: (*username).to_owned(),
                    email: (*email).to_owned(),
                    password: (*password).to_owned(),
                    confirm_password: (*password).to_owned(),
                    gender: parse_gender(gender)?,
                }))
            }
            _ => Err(ParseError::Usage(
                "/register <user> <email> <password> <male|female>",
            )),
        },
        "restore" => single(BackendCommand::RestoreSession),
        "logout" => single(BackendCommand::Logout),
        "profile" => parse_profile(&args).map(|update| {
            CliAction::Backend(vec![BackendCommand::UpdateProfile(update)])
        }),
        "password" => match args.as_slice() {
            [old, new, confirm] => single(BackendCommand::ChangePassword(PasswordChange {
                old_password: (*old).to_owned(),
                new_password: (*new).to_owned(),
                confirm_password: (*confirm).to_owned(),
            })),
            _ => Err(ParseError::Usage("/password <old> <new> <confirm>")),
        },
        "list" => single(BackendCommand::RefreshConversations),
        "search" => single(BackendCommand::SearchUsers {
            query: rest.to_owned(),
        }),
        "start" => single(BackendCommand::StartConversation {
            peer_id: parse_id(one_arg(&args, "/start <peer_id>")?, "peer id")?,
        }),
        "open" => single(BackendCommand::OpenConversation {
            conversation_id: parse_id(
                one_arg(&args, "/open <conversation_id>")?,
                "conversation id",
            )?,
        }),
        "close" => single(BackendCommand::CloseConversation),
        "hide" => single(BackendCommand::HideConversation {
            conversation_id: parse_id(
                one_arg(&args, "/hide <conversation_id>")?,
                "conversation id",
            )?,
        }),
        "clear" => single(BackendCommand::ClearConversation {
            conversation_id: parse_id(
                one_arg(&args, "/clear <conversation_id>")?,
                "conversation id",
            )?,
        }),
        "older" => single(BackendCommand::LoadOlderMessages),
        "reload" => single(BackendCommand::ReloadMessages),
        "attach" if !rest.is_empty() => Ok(CliAction::Attach {
            path: PathBuf::from(rest),
        }),
        "attach" => Err(ParseError::Usage("/attach <path>")),
        "detach" => {
            let raw = one_arg(&args, "/detach <index>")?;
            let index = raw.parse::<usize>().map_err(|_| ParseError::InvalidArgument {
                what: "index",
                value: raw.to_owned(),
            })?;
            single(BackendCommand::RemovePendingFile { index })
        }
        "detach-all" => single(BackendCommand::ClearPendingFiles),
        "edit" => {
            let (raw_id, text) = split_word(rest);
            if raw_id.is_empty() || text.is_empty() {
                return Err(ParseError::Usage("/edit <message_id> <text>"));
            }
            let message_id = parse_id(raw_id, "message id")?;
            Ok(CliAction::Backend(vec![
                BackendCommand::StartEdit { message_id },
                BackendCommand::SetEditText {
                    text: text.to_owned(),
                },
                BackendCommand::SaveEdit,
            ]))
        }
        "delete" => match args.as_slice() {
            [message_id] | [message_id, _] => single(BackendCommand::DeleteMessage {
                message_id: parse_id(message_id, "message id")?,
                scope: parse_scope(args.get(1).copied())?,
            }),
            _ => Err(ParseError::Usage("/delete <message_id> [me|all]")),
        },
        "delete-file" => match args.as_slice() {
            [message_id, attachment_id] | [message_id, attachment_id, _] => {
                single(BackendCommand::DeleteAttachment {
                    message_id: parse_id(message_id, "message id")?,
                    attachment_id: parse_id(attachment_id, "attachment id")?,
                    scope: parse_scope(args.get(2).copied())?,
                })
            }
            _ => Err(ParseError::Usage(
                "/delete-file <message_id> <attachment_id> [me|all]",
            )),
        },
        "download" => single(BackendCommand::DownloadAttachment {
            attachment_id: parse_id(one_arg(&args, "/download <attachment_id>")?, "attachment id")?,
        }),
        "read" => match args.as_slice() {
            [] => single(BackendCommand::MarkRead {
                up_to_message_id: None,
            }),
            [message_id] => single(BackendCommand::MarkRead {
                up_to_message_id: Some(parse_id(message_id, "message id")?),
            }),
            _ => Err(ParseError::Usage("/read [message_id]")),
        },
        "publish" => {
            let payload =
                serde_json::from_str(rest).map_err(|_| ParseError::InvalidArgument {
                    what: "json payload",
                    value: rest.to_owned(),
                })?;
            single(BackendCommand::PublishPush { payload })
        }
        other => Err(ParseError::UnknownCommand(other.to_owned())),
    }
}

fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, tail.trim()),
        None => (input, ""),
    }
}

fn one_arg<'a>(args: &[&'a str], usage: &'static str) -> Result<&'a str, ParseError> {
    match args {
        [value] => Ok(*value),
        _ => Err(ParseError::Usage(usage)),
    }
}

fn parse_id(raw: &str, what: &'static str) -> Result<i64, ParseError> {
    raw.parse::<i64>().map_err(|_| ParseError::InvalidArgument {
        what,
        value: raw.to_owned(),
    })
}

fn parse_gender(raw: &str) -> Result<Gender, ParseError> {
    match raw.to_ascii_lowercase().as_str() {
        "male" | "m" => Ok(Gender::Male),
        "female" | "f" => Ok(Gender::Female),
        _ => Err(ParseError::InvalidArgument {
            what: "gender",
            value: raw.to_owned(),
        }),
    }
}

fn parse_scope(raw: Option<&str>) -> Result<DeleteScope, ParseError> {
    match raw {
        None | Some("me") => Ok(DeleteScope::Me),
        Some("all") => Ok(DeleteScope::All),
        Some(other) => Err(ParseError::InvalidArgument {
            what: "delete scope",
            value: other.to_owned(),
        }),
    }
}

fn parse_profile(args: &[&str]) -> Result<ProfileUpdate, ParseError> {
    let mut update = ProfileUpdate::default();
    for arg in args {
        match arg.split_once('=') {
            Some(("name", value)) => update.username = Some(value.to_owned()),
            Some(("gender", value)) => update.gender = Some(parse_gender(value)?),
            _ => {
                return Err(ParseError::Usage(
                    "/profile [name=<user>] [gender=<male|female>]",
                ));
            }
        }
    }
    Ok(update)
}
