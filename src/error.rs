//! Error taxonomy for the playback core.
//!
//! Only [`TransportError`] ever leads to a teardown. Acquisition and playback
//! failures are fed back into the queue state machine, and user input is
//! rejected before any state is touched.

use thiserror::Error;

/// The player factory could not produce a playable resource for a track.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("URL inválida: {0}")]
    InvalidUrl(String),

    #[error("error de red: {0}")]
    Network(String),

    #[error("no se pudo decodificar el audio: {0}")]
    Decode(String),

    #[error("tiempo de espera agotado tras {0}s")]
    Timeout(u64),
}

/// The player reported a failure after the resource was handed to it.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct PlaybackError(pub String);

/// Voice transport failure. Never retried by the core.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("la conexión de voz ya fue destruida")]
    Destroyed,

    #[error("no hay conexión de voz para esta guild")]
    Missing,

    #[error("fallo del transporte de voz: {0}")]
    Failed(String),
}

/// Rejected at the operation boundary, no state mutation happens.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UserInputError {
    #[error("modo de repetición desconocido: `{0}` (usa off, song o queue)")]
    UnknownLoopMode(String),

    #[error("volumen fuera de rango: {value} (permitido 0-{max})")]
    VolumeOutOfRange { value: i64, max: i64 },

    #[error("el volumen debe ser un número finito")]
    InvalidVolume,
}

/// A notification sink call failed. Always swallowed by the core.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct SinkError(pub String);
