// ============================================================
// Layer 3 — Continuation Decision
// ============================================================
// When the epoch counter reaches the configured maximum the loop
// suspends and asks a ContinuationPolicy what to do next. Any
// response that is not a positive integer ends the run; it is a
// stop signal, never an error.

/// What the loop does once the epoch budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationDecision {
    /// Terminate the loop.
    Stop,
    /// Extend the maximum epoch count by this many epochs and resume.
    ContinueFor(usize),
}

impl ContinuationDecision {
    /// Interpret one line of operator text.
    ///
    /// "3" → ContinueFor(3); "0", "-2", "abc" or "" → Stop
    pub fn parse(input: &str) -> Self {
        match input.trim().parse::<i64>() {
            Ok(n) if n > 0 => match usize::try_from(n) {
                Ok(n)  => Self::ContinueFor(n),
                Err(_) => Self::Stop,
            },
            Ok(n) => {
                tracing::debug!("Non-positive continuation input {}; stopping", n);
                Self::Stop
            }
            Err(_) => {
                tracing::debug!("Non-numeric continuation input {:?}; stopping", input.trim());
                Self::Stop
            }
        }
    }
}
