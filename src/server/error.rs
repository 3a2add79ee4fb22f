//! HTTP-facing error mapping, grounded in the teacher's `server/error.rs`
//! `thiserror` enum + `IntoResponse` shape, adapted to the relay's own
//! component errors instead of the identity-tree's.

use axum::response::IntoResponse;
use axum::Json;
use hyper::StatusCode;
use serde_json::json;
use thiserror::Error;

use crate::admission::AdmissionError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Admission(err) => match err {
                AdmissionError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
                AdmissionError::WrongHub { .. }
                | AdmissionError::WrongWorker { .. }
                | AdmissionError::GasPriceTooLow { .. }
                | AdmissionError::PctFeeTooLow { .. }
                | AdmissionError::BaseFeeTooLow { .. }
                | AdmissionError::NonceHorizonExceeded { .. }
                | AdmissionError::AcceptanceBudgetTooHigh { .. }
                | AdmissionError::InsufficientPaymasterFunds { .. }
                | AdmissionError::PaymasterRejected { .. } => StatusCode::BAD_REQUEST,
                AdmissionError::Chain(_)
                | AdmissionError::TxManager(_)
                | AdmissionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
