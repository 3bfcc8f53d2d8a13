//! 2Captcha solving client
//!
//! Thin JSON client over the 2Captcha task API: create a task, poll for the
//! result every few seconds, give up after the solve budget.

use std::time::{Duration, Instant};

use reqwest::Client;
use tracing::{debug, info, warn};

use super::types::{
    CaptchaError, CaptchaRequest, CaptchaResult, ChallengeKind, TwoCaptchaCreateResponse,
    TwoCaptchaCreateTask, TwoCaptchaGetResult, TwoCaptchaResultResponse, TwoCaptchaTask,
};

/// 2Captcha API base URL
const TWOCAPTCHA_API: &str = "https://api.2captcha.com";

/// Challenge solver backed by the 2Captcha service
pub struct CaptchaSolver {
    api_key: String,
    client: Client,
    poll_interval: Duration,
    max_solve_time: Duration,
}

impl CaptchaSolver {
    pub fn new(api_key: &str) -> Result<Self, CaptchaError> {
        if api_key.trim().is_empty() {
            return Err(CaptchaError::ApiKeyMissing);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CaptchaError::NetworkError(e.to_string()))?;

        Ok(Self {
            api_key: api_key.to_string(),
            client,
            poll_interval: Duration::from_secs(5),
            max_solve_time: Duration::from_secs(120),
        })
    }

    /// Set poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set maximum solve time
    pub fn with_max_solve_time(mut self, timeout: Duration) -> Self {
        self.max_solve_time = timeout;
        self
    }

    /// Solve a widget challenge. Blocks up to the solve budget.
    pub async fn solve(&self, request: &CaptchaRequest) -> Result<CaptchaResult, CaptchaError> {
        let task = match request.kind {
            ChallengeKind::RecaptchaV2 => TwoCaptchaTask::RecaptchaV2Proxyless {
                website_url: request.page_url.clone(),
                website_key: request.sitekey.clone(),
            },
            ChallengeKind::RecaptchaV3 => TwoCaptchaTask::RecaptchaV3Proxyless {
                website_url: request.page_url.clone(),
                website_key: request.sitekey.clone(),
                page_action: request
                    .action
                    .clone()
                    .unwrap_or_else(|| "submit".to_string()),
                min_score: request.min_score.unwrap_or(0.5),
            },
            ChallengeKind::HCaptcha => TwoCaptchaTask::HCaptchaProxyless {
                website_url: request.page_url.clone(),
                website_key: request.sitekey.clone(),
            },
            ChallengeKind::Turnstile => TwoCaptchaTask::TurnstileProxyless {
                website_url: request.page_url.clone(),
                website_key: request.sitekey.clone(),
            },
            ChallengeKind::Unknown => {
                return Err(CaptchaError::Unresolved(
                    "no solvable widget on page".to_string(),
                ))
            }
        };

        info!(
            "Submitting {:?} challenge for {} to 2Captcha",
            request.kind, request.page_url
        );
        self.run_task(task, self.solve_budget(request.kind)).await
    }

    /// Time allowed for one solve. Waiting longer than the token lives would
    /// hand back a token that expires before injection.
    fn solve_budget(&self, kind: ChallengeKind) -> Duration {
        let ttl = Duration::from_secs(kind.token_ttl_secs());
        if ttl.is_zero() {
            self.max_solve_time
        } else {
            self.max_solve_time.min(ttl)
        }
    }

    /// Solve an image challenge from raw PNG bytes
    pub async fn solve_image(&self, png: &[u8]) -> Result<CaptchaResult, CaptchaError> {
        use base64::Engine;
        let body = base64::engine::general_purpose::STANDARD.encode(png);
        info!(
            "Submitting image challenge ({} bytes) to 2Captcha",
            png.len()
        );
        self.run_task(TwoCaptchaTask::ImageToText { body }, self.max_solve_time)
            .await
    }

    /// Check the account balance (sanity probe for the configured key)
    pub async fn get_balance(&self) -> Result<f64, CaptchaError> {
        let response = self
            .client
            .post(format!("{}/getBalance", TWOCAPTCHA_API))
            .json(&serde_json::json!({ "clientKey": self.api_key }))
            .send()
            .await
            .map_err(|e| CaptchaError::NetworkError(e.to_string()))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CaptchaError::InvalidResponse(e.to_string()))?;

        if body.get("errorId").and_then(|v| v.as_i64()).unwrap_or(0) != 0 {
            return Err(CaptchaError::ApiError(
                body.get("errorDescription")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error")
                    .to_string(),
            ));
        }

        body.get("balance")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| CaptchaError::InvalidResponse("missing balance field".to_string()))
    }

    async fn run_task(
        &self,
        task: TwoCaptchaTask,
        budget: Duration,
    ) -> Result<CaptchaResult, CaptchaError> {
        let started = Instant::now();
        let task_id = self.create_task(task).await?;
        debug!("2Captcha task {} created", task_id);

        loop {
            if started.elapsed() >= budget {
                warn!("2Captcha task {} exceeded solve budget", task_id);
                return Err(CaptchaError::Timeout(budget.as_secs()));
            }
            tokio::time::sleep(self.poll_interval).await;

            let result = self.get_result(task_id).await?;
            if result.is_processing() {
                continue;
            }
            if result.is_ready() {
                let token = result
                    .get_token()
                    .ok_or_else(|| {
                        CaptchaError::InvalidResponse("ready result without token".to_string())
                    })?
                    .to_string();
                let solve_time_ms = started.elapsed().as_millis() as u64;
                info!("2Captcha task {} solved in {}ms", task_id, solve_time_ms);
                return Ok(CaptchaResult {
                    token,
                    solve_time_ms,
                });
            }
            return Err(CaptchaError::ApiError(
                result
                    .error_description
                    .or(result.error_code)
                    .unwrap_or_else(|| "task failed without description".to_string()),
            ));
        }
    }

    async fn create_task(&self, task: TwoCaptchaTask) -> Result<i64, CaptchaError> {
        let payload = TwoCaptchaCreateTask {
            client_key: self.api_key.clone(),
            task,
        };
        let response = self
            .client
            .post(format!("{}/createTask", TWOCAPTCHA_API))
            .json(&payload)
            .send()
            .await
            .map_err(|e| CaptchaError::NetworkError(e.to_string()))?;

        let body: TwoCaptchaCreateResponse = response
            .json()
            .await
            .map_err(|e| CaptchaError::InvalidResponse(e.to_string()))?;

        if body.error_id != 0 {
            return Err(CaptchaError::TaskCreationFailed(
                body.error_description
                    .or(body.error_code)
                    .unwrap_or_else(|| format!("errorId {}", body.error_id)),
            ));
        }
        body.task_id
            .ok_or_else(|| CaptchaError::InvalidResponse("missing taskId".to_string()))
    }

    async fn get_result(&self, task_id: i64) -> Result<TwoCaptchaResultResponse, CaptchaError> {
        let payload = TwoCaptchaGetResult {
            client_key: self.api_key.clone(),
            task_id,
        };
        let response = self
            .client
            .post(format!("{}/getTaskResult", TWOCAPTCHA_API))
            .json(&payload)
            .send()
            .await
            .map_err(|e| CaptchaError::NetworkError(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| CaptchaError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(matches!(
            CaptchaSolver::new("  "),
            Err(CaptchaError::ApiKeyMissing)
        ));
    }

    #[test]
    fn solve_budget_never_exceeds_the_token_ttl() {
        let solver = CaptchaSolver::new("key")
            .unwrap()
            .with_max_solve_time(Duration::from_secs(600));
        assert_eq!(
            solver.solve_budget(ChallengeKind::RecaptchaV2),
            Duration::from_secs(120)
        );
        assert_eq!(
            solver.solve_budget(ChallengeKind::Turnstile),
            Duration::from_secs(300)
        );

        // A tighter configured budget wins over the TTL
        let tight = CaptchaSolver::new("key")
            .unwrap()
            .with_max_solve_time(Duration::from_secs(60));
        assert_eq!(
            tight.solve_budget(ChallengeKind::HCaptcha),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn ready_response_exposes_token() {
        let json = r#"{"errorId":0,"status":"ready","solution":{"gRecaptchaResponse":"tok-123"}}"#;
        let parsed: TwoCaptchaResultResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.is_ready());
        assert_eq!(parsed.get_token(), Some("tok-123"));
    }

    #[test]
    fn processing_response_has_no_token() {
        let json = r#"{"errorId":0,"status":"processing"}"#;
        let parsed: TwoCaptchaResultResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.is_processing());
        assert_eq!(parsed.get_token(), None);
    }

    #[test]
    fn image_solution_text_is_used_as_token() {
        let json = r#"{"errorId":0,"status":"ready","solution":{"text":"x7kq2"}}"#;
        let parsed: TwoCaptchaResultResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.get_token(), Some("x7kq2"));
    }
}
