use crate::{
    error::BackendError,
    types::{BackendCommand, BackendEvent, BackendLifecycleState},
};

#[derive(Debug, Clone)]
pub struct BackendStateMachine {
    state: BackendLifecycleState,
}

impl Default for BackendStateMachine {
    fn default() -> Self {
        Self {
            state: BackendLifecycleState::Cold,
        }
    }
}

impl BackendStateMachine {
    pub fn state(&self) -> BackendLifecycleState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == BackendLifecycleState::Authenticated
    }

    pub fn apply(&mut self, command: &BackendCommand) -> Result<Vec<BackendEvent>, BackendError> {
        use BackendCommand::*;

        match command {
            Init { .. } => self.transition_from_any_of(
                &[BackendLifecycleState::Cold],
                BackendLifecycleState::Configured,
                "init",
            ),
            Login { .. } | RestoreSession => self.transition_from_any_of(
                &[
                    BackendLifecycleState::Configured,
                    BackendLifecycleState::LoggedOut,
                ],
                BackendLifecycleState::Authenticating,
                "login_or_restore",
            ),
            Logout => self.transition_from_any_of(
                &[
                    BackendLifecycleState::Configured,
                    BackendLifecycleState::Authenticating,
                    BackendLifecycleState::Authenticated,
                ],
                BackendLifecycleState::LoggedOut,
                "logout",
            ),
            Register(_) => {
                if matches!(
                    self.state,
                    BackendLifecycleState::Configured | BackendLifecycleState::LoggedOut
                ) {
                    Ok(Vec::new())
                } else {
                    Err(BackendError::invalid_state(self.state, "register"))
                }
            }
            _ => {
                if self.is_authenticated() {
                    Ok(Vec::new())
                } else {
                    Err(BackendError::invalid_state(self.state, "session command"))
                }
            }
        }
    }

    pub fn on_auth_result(&mut self, success: bool) -> Result<BackendEvent, BackendError> {
        if self.state != BackendLifecycleState::Authenticating {
            return Err(BackendError::invalid_state(self.state, "on_auth_result"));
        }

        let next = if success {
            BackendLifecycleState::Authenticated
        } else {
            BackendLifecycleState::LoggedOut
        };

        self.state = next;
        Ok(BackendEvent::StateChanged { state: next })
    }

    /// Credential rejected mid-session. Returns `None` when already signed out.
    pub fn on_session_lost(&mut self) -> Option<BackendEvent> {
        if matches!(
            self.state,
            BackendLifecycleState::Authenticated | BackendLifecycleState::Authenticating
        ) {
            self.state = BackendLifecycleState::LoggedOut;
            Some(BackendEvent::StateChanged {
                state: BackendLifecycleState::LoggedOut,
            })
        } else {
            None
        }
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[BackendLifecycleState],
        next: BackendLifecycleState,
        action: &str,
    ) -> Result<Vec<BackendEvent>, BackendError> {
        if !expected.contains(&self.state) {
            return Err(BackendError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![BackendEvent::StateChanged { state: next }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Gender, RegistrationForm};

    fn login_command() -> BackendCommand {
        BackendCommand::Login {
            login: "olena".into(),
            password: "secret1".into(),
        }
    }

    #[test]
    fn runs_happy_path_state_transitions() {
        let mut sm = BackendStateMachine::default();

        sm.apply(&BackendCommand::Init { config: None })
            .expect("init must work");
        assert_eq!(sm.state(), BackendLifecycleState::Configured);

        sm.apply(&login_command()).expect("login command must work");
        assert_eq!(sm.state(), BackendLifecycleState::Authenticating);

        sm.on_auth_result(true).expect("auth should resolve");
        assert_eq!(sm.state(), BackendLifecycleState::Authenticated);

        sm.apply(&BackendCommand::OpenConversation { conversation_id: 1 })
            .expect("session command should be accepted");

        sm.apply(&BackendCommand::Logout).expect("logout should work");
        assert_eq!(sm.state(), BackendLifecycleState::LoggedOut);

        sm.apply(&BackendCommand::RestoreSession)
            .expect("restore after logout should work");
        assert_eq!(sm.state(), BackendLifecycleState::Authenticating);
    }

    #[test]
    fn failed_auth_lands_in_logged_out() {
        let mut sm = BackendStateMachine::default();
        sm.apply(&BackendCommand::Init { config: None })
            .expect("init must work");
        sm.apply(&login_command()).expect("login must start");

        let event = sm.on_auth_result(false).expect("auth should resolve");
        assert_eq!(
            event,
            BackendEvent::StateChanged {
                state: BackendLifecycleState::LoggedOut
            }
        );
    }

    #[test]
    fn rejects_session_commands_without_auth() {
        let mut sm = BackendStateMachine::default();
        sm.apply(&BackendCommand::Init { config: None })
            .expect("init must work");

        let err = sm
            .apply(&BackendCommand::SendMessage {
                client_txn_id: "tx-1".into(),
            })
            .expect_err("send should fail without auth");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn register_is_only_allowed_while_signed_out() {
        let form = BackendCommand::Register(RegistrationForm {
            username: "olena".into(),
            email: "olena@example.org".into(),
            password: "secret1".into(),
            confirm_password: "secret1".into(),
            gender: Gender::Female,
        });

        let mut sm = BackendStateMachine::default();
        assert!(sm.apply(&form).is_err());
        sm.apply(&BackendCommand::Init { config: None })
            .expect("init must work");
        assert!(sm.apply(&form).is_ok());
        assert_eq!(sm.state(), BackendLifecycleState::Configured);
    }

    #[test]
    fn session_loss_only_fires_once() {
        let mut sm = BackendStateMachine::default();
        sm.apply(&BackendCommand::Init { config: None })
            .expect("init must work");
        sm.apply(&login_command()).expect("login must start");
        sm.on_auth_result(true).expect("auth should resolve");

        assert!(sm.on_session_lost().is_some());
        assert!(sm.on_session_lost().is_none());
    }
}
