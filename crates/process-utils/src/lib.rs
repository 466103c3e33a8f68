//! Child-process helpers for external tool invocations.
//!
//! [`tokio_command`] builds a command that opens no console window on
//! Windows, and [`run_cancellable`] runs it while streaming stderr and
//! honouring a cancellation token.

use std::ffi::OsStr;

mod runner;

pub use runner::{RunOutcome, run_cancellable};

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    #[allow(unused_mut)]
    let mut cmd = tokio::process::Command::new(program);
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}
