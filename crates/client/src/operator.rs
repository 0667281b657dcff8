//! Operator id prompting on top of the session state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};

use stockcount_core::{OperatorId, OperatorSession};

use crate::error::ClientError;

/// Delay between prompts after a blank answer.
pub const REPROMPT_INTERVAL: Duration = Duration::from_secs(1);

/// Source of operator ids (a dialog, a terminal line, a test script).
#[async_trait::async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Ask for an operator id. `None` means the input is closed for good.
    async fn request_operator(&self, last_known: Option<&OperatorId>) -> Option<String>;
}

/// Return the session's operator, prompting until a non-blank id is given.
///
/// Never yields without an operator: blank answers are retried every
/// [`REPROMPT_INTERVAL`], and a closed prompt is an error.
pub async fn ensure_operator(
    session: &mut OperatorSession,
    prompt: &dyn OperatorPrompt,
    now: DateTime<Utc>,
) -> Result<OperatorId, ClientError> {
    if let Some(operator) = session.current(now) {
        return Ok(operator.clone());
    }

    if session.last_known().is_some() {
        tracing::info!("operator session expired; prompting");
    }

    loop {
        let Some(response) = prompt.request_operator(session.last_known()).await else {
            tracing::warn!("operator prompt closed without an answer");
            return Err(ClientError::NoOperator);
        };
        match session.sign_in(&response, now) {
            Ok(operator) => {
                tracing::info!(operator = %operator, "operator signed in");
                return Ok(operator);
            }
            Err(_) => {
                tracing::debug!("blank operator id; asking again");
                tokio::time::sleep(REPROMPT_INTERVAL).await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers from a fixed script, then reports the input closed.
    #[derive(Default)]
    pub(crate) struct ScriptedPrompt {
        answers: Mutex<VecDeque<String>>,
        asked: Mutex<usize>,
    }

    impl ScriptedPrompt {
        pub(crate) fn new<'a>(answers: impl IntoIterator<Item = &'a str>) -> Self {
            Self {
                answers: Mutex::new(answers.into_iter().map(str::to_string).collect()),
                asked: Mutex::new(0),
            }
        }

        pub(crate) fn asked(&self) -> usize {
            *self.asked.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl OperatorPrompt for ScriptedPrompt {
        async fn request_operator(&self, _last_known: Option<&OperatorId>) -> Option<String> {
            *self.asked.lock().unwrap() += 1;
            self.answers.lock().unwrap().pop_front()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn blank_answers_are_retried_every_second() {
        let mut session = OperatorSession::default();
        let prompt = ScriptedPrompt::new(["", "  ", "E42"]);
        let started = tokio::time::Instant::now();

        let operator = ensure_operator(&mut session, &prompt, Utc::now()).await.unwrap();

        assert_eq!(operator.as_str(), "E42");
        assert_eq!(prompt.asked(), 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn fresh_session_does_not_prompt() {
        let mut session = OperatorSession::default();
        let now = Utc::now();
        session.sign_in("E1", now).unwrap();
        let prompt = ScriptedPrompt::new([]);

        let operator = ensure_operator(&mut session, &prompt, now).await.unwrap();
        assert_eq!(operator.as_str(), "E1");
        assert_eq!(prompt.asked(), 0);
    }

    #[tokio::test]
    async fn closed_prompt_is_a_session_gap() {
        let mut session = OperatorSession::default();
        let prompt = ScriptedPrompt::new([]);
        let err = ensure_operator(&mut session, &prompt, Utc::now()).await.unwrap_err();
        assert!(matches!(err, ClientError::NoOperator));
    }
}
