//! Errors raised by the binary itself, mapped to process exit codes.

use stagecheck_core::exit_code;
use stagecheck_core::StagecheckError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0:#}")]
    Config(anyhow::Error),

    #[error("no config file given and none found; pass --config or set STAGECHECK_CONFIG")]
    NoConfig,

    #[error("`{0}` must be set for a live run")]
    MissingSetting(&'static str),
}

/// Exit code for an error that prevented a run from producing a result.
///
/// Configuration problems map to the config exit code; anything else is a
/// plain failure.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    let config_error = err.chain().any(|cause| {
        cause.downcast_ref::<CliError>().is_some()
            || matches!(
                cause.downcast_ref::<StagecheckError>(),
                Some(StagecheckError::Config(_))
            )
    });
    if config_error {
        exit_code::CONFIG_ERROR
    } else {
        exit_code::FAILED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn config_errors_map_to_the_config_exit_code() {
        let err = anyhow::Error::new(CliError::NoConfig);
        assert_eq!(exit_code_for(&err), exit_code::CONFIG_ERROR);

        let wrapped: anyhow::Result<()> = Err(StagecheckError::Config("bad regex".into()))
            .context("building orchestrator");
        assert_eq!(exit_code_for(&wrapped.unwrap_err()), exit_code::CONFIG_ERROR);

        let io = anyhow::anyhow!("disk full");
        assert_eq!(exit_code_for(&io), exit_code::FAILED);
    }
}
