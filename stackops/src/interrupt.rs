use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

/// Whether the operator asked us to stop (Ctrl-C).
///
/// Long-running work checks it between phases; async code can also await
/// [`interrupted`](Self::interrupted).
#[derive(Clone, Debug, Default)]
pub struct InterruptState {
    token: CancellationToken,
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("interrupted")]
pub struct InterruptedError {}

impl InterruptState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_interrupted(&self) {
        self.token.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check_interrupted_raw(&self) -> Result<(), InterruptedError> {
        if self.is_interrupted() {
            Err(InterruptedError {})
        } else {
            Ok(())
        }
    }

    /// Resolves once an interrupt arrives.
    pub async fn interrupted(&self) {
        self.token.cancelled().await
    }

    /// A token that is cancelled on interrupt, for handing to tasks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

fn set_process_interrupt_handler(interrupted: &InterruptState) -> Result<()> {
    let interrupted = interrupted.clone();
    ctrlc::set_handler(move || {
        if interrupted.is_interrupted() {
            // Second Ctrl-C: the operator means it.
            std::process::exit(130);
        }
        interrupted.set_interrupted();
    })
    .context("Error setting interrupt handler")
}

pub fn set_up_process_interrupt_handler() -> Result<InterruptState> {
    let interrupt_state = InterruptState::new();
    set_process_interrupt_handler(&interrupt_state)?;
    Ok(interrupt_state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn interrupt_wakes_waiters() {
        let state = InterruptState::new();
        assert!(state.check_interrupted_raw().is_ok());
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.interrupted().await })
        };
        state.set_interrupted();
        waiter.await.unwrap();
        assert!(state.is_interrupted());
        assert!(state.token().is_cancelled());
        assert!(state.check_interrupted_raw().is_err());
    }
}
