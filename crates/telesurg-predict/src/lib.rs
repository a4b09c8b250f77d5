//! Telesurg Predict - Motion prediction for latency compensation
//!
//! Streams arrive late; prediction extrapolates each instrument forward by the
//! expected transport latency. Strategies are interchangeable behind
//! [`MotionPredictor`]:
//! - [`KalmanPredictor`]: per-axis filter plus weighted velocity
//! - [`RegressionPredictor`]: sliding window of deltas through a fitted linear map
//! - [`PolynomialPredictor`]: least-squares polynomial extrapolation
//!
//! Every prediction passes the [`PredictionValidator`]; rejected predictions
//! fall back to the current state. Prediction is advisory: the safety filter
//! downstream still enforces hard bounds.

pub mod engine;
pub mod kalman;
mod linalg;
pub mod polynomial;
pub mod predictor;
pub mod regression;
pub mod selector;
pub mod validator;

pub use engine::*;
pub use kalman::*;
pub use polynomial::*;
pub use predictor::*;
pub use regression::*;
pub use selector::*;
pub use validator::*;
