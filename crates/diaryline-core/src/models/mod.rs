//! Data models for the diary backend.
//!
//! - `User`: the signed-in user's profile
//! - `AnalysisReport`, `AnalysisStatus`, `Emotion`: AI analysis job state for a diary

pub mod analysis;
pub mod user;

pub use analysis::{AnalysisReport, AnalysisStatus, Emotion};
pub use user::User;
