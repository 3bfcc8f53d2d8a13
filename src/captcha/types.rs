//! Challenge types and 2Captcha API models

use serde::{Deserialize, Serialize};

/// Supported challenge families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChallengeKind {
    RecaptchaV2,
    RecaptchaV3,
    HCaptcha,
    Turnstile,
    /// Challenge markers present but no recognized widget or site key
    Unknown,
}

impl ChallengeKind {
    /// Token time-to-live in seconds
    pub fn token_ttl_secs(&self) -> u64 {
        match self {
            Self::RecaptchaV2 | Self::RecaptchaV3 | Self::HCaptcha => 120,
            Self::Turnstile => 300,
            Self::Unknown => 0,
        }
    }
}

/// Result of inspecting a page for challenge widgets
#[derive(Debug, Clone)]
pub struct ChallengeDetection {
    pub kind: ChallengeKind,
    pub sitekey: Option<String>,
}

impl ChallengeDetection {
    /// Whether a solving provider could be asked for a token
    pub fn solvable(&self) -> bool {
        self.kind != ChallengeKind::Unknown && self.sitekey.is_some()
    }
}

/// Challenge solve request sent to the provider
#[derive(Debug, Clone)]
pub struct CaptchaRequest {
    pub kind: ChallengeKind,
    pub sitekey: String,
    pub page_url: String,
    pub action: Option<String>,
    pub min_score: Option<f64>,
}

impl CaptchaRequest {
    /// Build a request from a detection; `None` when the detection is unsolvable
    pub fn from_detection(detection: &ChallengeDetection, page_url: &str) -> Option<Self> {
        let sitekey = detection.sitekey.clone()?;
        if detection.kind == ChallengeKind::Unknown {
            return None;
        }
        Some(Self {
            kind: detection.kind,
            sitekey,
            page_url: page_url.to_string(),
            action: match detection.kind {
                ChallengeKind::RecaptchaV3 => Some("submit".to_string()),
                _ => None,
            },
            min_score: match detection.kind {
                ChallengeKind::RecaptchaV3 => Some(0.5),
                _ => None,
            },
        })
    }
}

/// Challenge solve result
#[derive(Debug, Clone)]
pub struct CaptchaResult {
    pub token: String,
    pub solve_time_ms: u64,
}

// ========== 2Captcha API models ==========

/// 2Captcha create task request
#[derive(Debug, Serialize)]
pub struct TwoCaptchaCreateTask {
    #[serde(rename = "clientKey")]
    pub client_key: String,
    pub task: TwoCaptchaTask,
}

/// 2Captcha task types
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum TwoCaptchaTask {
    #[serde(rename = "RecaptchaV2TaskProxyless")]
    RecaptchaV2Proxyless {
        #[serde(rename = "websiteURL")]
        website_url: String,
        #[serde(rename = "websiteKey")]
        website_key: String,
    },

    #[serde(rename = "RecaptchaV3TaskProxyless")]
    RecaptchaV3Proxyless {
        #[serde(rename = "websiteURL")]
        website_url: String,
        #[serde(rename = "websiteKey")]
        website_key: String,
        #[serde(rename = "pageAction")]
        page_action: String,
        #[serde(rename = "minScore")]
        min_score: f64,
    },

    #[serde(rename = "HCaptchaTaskProxyless")]
    HCaptchaProxyless {
        #[serde(rename = "websiteURL")]
        website_url: String,
        #[serde(rename = "websiteKey")]
        website_key: String,
    },

    #[serde(rename = "TurnstileTaskProxyless")]
    TurnstileProxyless {
        #[serde(rename = "websiteURL")]
        website_url: String,
        #[serde(rename = "websiteKey")]
        website_key: String,
    },

    #[serde(rename = "ImageToTextTask")]
    ImageToText {
        /// Base64-encoded challenge image
        body: String,
    },
}

/// 2Captcha create task response
#[derive(Debug, Deserialize)]
pub struct TwoCaptchaCreateResponse {
    #[serde(rename = "errorId")]
    pub error_id: i32,
    #[serde(rename = "errorCode")]
    pub error_code: Option<String>,
    #[serde(rename = "errorDescription")]
    pub error_description: Option<String>,
    #[serde(rename = "taskId")]
    pub task_id: Option<i64>,
}

/// 2Captcha get result request
#[derive(Debug, Serialize)]
pub struct TwoCaptchaGetResult {
    #[serde(rename = "clientKey")]
    pub client_key: String,
    #[serde(rename = "taskId")]
    pub task_id: i64,
}

/// 2Captcha get result response
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct TwoCaptchaResultResponse {
    #[serde(rename = "errorId")]
    pub error_id: i32,
    #[serde(rename = "errorCode")]
    pub error_code: Option<String>,
    #[serde(rename = "errorDescription")]
    pub error_description: Option<String>,
    pub status: Option<String>,
    pub solution: Option<TwoCaptchaSolution>,
}

impl TwoCaptchaResultResponse {
    pub fn is_processing(&self) -> bool {
        self.status.as_deref() == Some("processing")
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_deref() == Some("ready")
    }

    pub fn get_token(&self) -> Option<&str> {
        self.solution.as_ref().and_then(|s| {
            s.g_recaptcha_response
                .as_deref()
                .or(s.token.as_deref())
                .or(s.text.as_deref())
        })
    }
}

/// 2Captcha solution payload
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct TwoCaptchaSolution {
    #[serde(rename = "gRecaptchaResponse")]
    pub g_recaptcha_response: Option<String>,
    pub token: Option<String>,
    pub text: Option<String>,
}

/// Challenge solving errors
#[derive(Debug, thiserror::Error)]
pub enum CaptchaError {
    #[error("API key not configured")]
    ApiKeyMissing,

    #[error("2Captcha API error: {0}")]
    ApiError(String),

    #[error("Task creation failed: {0}")]
    TaskCreationFailed(String),

    #[error("Solve timeout after {0}s")]
    Timeout(u64),

    #[error("Challenge unresolved: {0}")]
    Unresolved(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_from_v3_detection_carries_action_and_score() {
        let detection = ChallengeDetection {
            kind: ChallengeKind::RecaptchaV3,
            sitekey: Some("6LtestKey".to_string()),
        };
        let req = CaptchaRequest::from_detection(&detection, "https://rdv.example.org").unwrap();
        assert_eq!(req.kind, ChallengeKind::RecaptchaV3);
        assert_eq!(req.action.as_deref(), Some("submit"));
        assert_eq!(req.min_score, Some(0.5));
    }

    #[test]
    fn unknown_detection_is_not_solvable() {
        let detection = ChallengeDetection {
            kind: ChallengeKind::Unknown,
            sitekey: None,
        };
        assert!(!detection.solvable());
        assert!(CaptchaRequest::from_detection(&detection, "https://x.example").is_none());
    }

    #[test]
    fn image_task_serializes_with_2captcha_type_tag() {
        let task = TwoCaptchaTask::ImageToText {
            body: "aGVsbG8=".to_string(),
        };
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"type\":\"ImageToTextTask\""));
    }
}
