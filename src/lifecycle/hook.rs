//! Pre-handoff hook.

/// Error returned by a [`RestartHook`].
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Runs right before a successor process is started.
///
/// Lets the current generation release resources the successor needs, or validate
/// that the new configuration is sane. A failure is recorded but does not stop the
/// handoff.
pub trait RestartHook: Send + Sync {
    fn before_restart(&self) -> Result<(), HookError>;
}

impl<F> RestartHook for F
where
    F: Fn() -> Result<(), HookError> + Send + Sync,
{
    fn before_restart(&self) -> Result<(), HookError> {
        self()
    }
}

/// Hook used when the application configured none.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl RestartHook for NoopHook {
    fn before_restart(&self) -> Result<(), HookError> {
        Ok(())
    }
}
