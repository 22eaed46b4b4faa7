use thiserror::Error;

/// Typed failure conditions the engine reports to callers. These travel
/// inside `anyhow` chains and are recovered by `downcast_ref` at the CLI
/// boundary, where each variant maps to a distinct exit code.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("insufficient space on staging drive: need {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("archive validation failed: {0}")]
    ArchiveValidation(String),

    #[error("operation canceled")]
    Canceled,

    #[error("{failed} of {total} files could not be restored")]
    PartialFailure { failed: usize, total: usize },

    #[error("catalog category {0:?} scanned again without reset")]
    CatalogReuse(crate::model::BackupCategory),
}

/// Walks an `anyhow` chain looking for a typed engine error.
pub fn engine_error(err: &anyhow::Error) -> Option<&EngineError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<EngineError>())
}

/// Process exit code for a failed operation. Success is 0; anything the
/// engine cannot classify is 1.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    match engine_error(err) {
        Some(EngineError::ArchiveValidation(_)) => 2,
        Some(EngineError::InsufficientSpace { .. }) => 3,
        Some(EngineError::Canceled) => 4,
        Some(EngineError::PartialFailure { .. }) => 5,
        _ => 1,
    }
}
