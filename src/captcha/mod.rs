//! Challenge detection and resolution
//!
//! Detects reCAPTCHA v2/v3, hCaptcha, Turnstile and Cloudflare interstitials
//! on monitored pages, solves them through 2Captcha, and injects the token
//! back into the page.

mod detect;
mod pipeline;
mod solver;
mod types;

pub use detect::detect_challenge;
pub use pipeline::{ChallengePipeline, ChallengeResolution};
pub use solver::CaptchaSolver;
pub use types::{
    CaptchaError, CaptchaRequest, CaptchaResult, ChallengeDetection, ChallengeKind,
};
