//! Shared client for the `createTask` / `getTaskResult` JSON API family.
//!
//! AntiCaptcha and CapSolver expose the same envelope: a numeric `errorId`
//! (0 on success), `errorCode`/`errorDescription` on failure, a `taskId` after
//! submission and a `status` of `processing` or `ready` while polling.

use serde_json::{Value, json};

use super::{CaptchaError, PollStatus};

/// Thin JSON client bound to one provider endpoint and API key.
#[derive(Debug, Clone)]
pub(crate) struct TaskApiClient {
    pub provider: &'static str,
    pub base_url: String,
    pub api_key: String,
    pub http: reqwest::Client,
}

impl TaskApiClient {
    pub async fn create_task(&self, task: Value) -> Result<String, CaptchaError> {
        let body = json!({
            "clientKey": self.api_key,
            "task": task,
        });
        let response: Value = self
            .http
            .post(format!("{}/createTask", self.base_url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        parse_create_response(self.provider, &response)
    }

    pub async fn task_result(&self, task_id: &str) -> Result<PollStatus, CaptchaError> {
        let task_id_value = task_id
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(task_id));
        let body = json!({
            "clientKey": self.api_key,
            "taskId": task_id_value,
        });
        let response: Value = self
            .http
            .post(format!("{}/getTaskResult", self.base_url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        parse_result_response(self.provider, &response)
    }
}

fn error_text(response: &Value) -> String {
    let code = response
        .get("errorCode")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN_ERROR");
    match response.get("errorDescription").and_then(Value::as_str) {
        Some(description) => format!("{code}: {description}"),
        None => code.to_string(),
    }
}

fn has_error(response: &Value) -> bool {
    response
        .get("errorId")
        .and_then(Value::as_u64)
        .is_some_and(|id| id != 0)
}

pub(crate) fn parse_create_response(
    provider: &str,
    response: &Value,
) -> Result<String, CaptchaError> {
    if has_error(response) {
        return Err(CaptchaError::Rejected {
            provider: provider.to_string(),
            reason: error_text(response),
        });
    }

    match response.get("taskId") {
        Some(Value::Number(id)) => Ok(id.to_string()),
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        _ => Err(CaptchaError::Provider(format!(
            "{provider} createTask response missing taskId"
        ))),
    }
}

pub(crate) fn parse_result_response(
    provider: &str,
    response: &Value,
) -> Result<PollStatus, CaptchaError> {
    if has_error(response) {
        return Ok(PollStatus::Failed(error_text(response)));
    }

    match response.get("status").and_then(Value::as_str) {
        Some("ready") => {
            let solution = response.get("solution");
            let token = solution
                .and_then(|s| s.get("gRecaptchaResponse").or_else(|| s.get("token")))
                .and_then(Value::as_str);
            match token {
                Some(token) if !token.is_empty() => Ok(PollStatus::Ready(token.to_string())),
                _ => Ok(PollStatus::Failed(format!(
                    "{provider} reported ready without a token"
                ))),
            }
        }
        Some("processing") | Some("idle") => Ok(PollStatus::NotReady),
        Some(other) => Err(CaptchaError::Provider(format!(
            "{provider} returned unknown task status '{other}'"
        ))),
        None => Err(CaptchaError::Provider(format!(
            "{provider} getTaskResult response missing status"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_accepts_numeric_and_string_ids() {
        let numeric = json!({"errorId": 0, "taskId": 7654321});
        assert_eq!(parse_create_response("p", &numeric).unwrap(), "7654321");

        let text = json!({"errorId": 0, "taskId": "61138bb6-19fb-11ec-a9c8-0242ac110006"});
        assert_eq!(
            parse_create_response("p", &text).unwrap(),
            "61138bb6-19fb-11ec-a9c8-0242ac110006"
        );
    }

    #[test]
    fn create_error_is_rejection() {
        let response = json!({
            "errorId": 1,
            "errorCode": "ERROR_KEY_DOES_NOT_EXIST",
            "errorDescription": "Account authorization key not found"
        });
        let err = parse_create_response("anticaptcha", &response).unwrap_err();
        match err {
            CaptchaError::Rejected { provider, reason } => {
                assert_eq!(provider, "anticaptcha");
                assert!(reason.starts_with("ERROR_KEY_DOES_NOT_EXIST"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn result_statuses_map_to_poll_status() {
        assert_eq!(
            parse_result_response("p", &json!({"errorId": 0, "status": "processing"})).unwrap(),
            PollStatus::NotReady
        );
        assert_eq!(
            parse_result_response(
                "p",
                &json!({"errorId": 0, "status": "ready", "solution": {"gRecaptchaResponse": "03AG"}})
            )
            .unwrap(),
            PollStatus::Ready("03AG".into())
        );
        assert_eq!(
            parse_result_response(
                "p",
                &json!({"errorId": 0, "status": "ready", "solution": {"token": "0.turnstile"}})
            )
            .unwrap(),
            PollStatus::Ready("0.turnstile".into())
        );
        assert!(matches!(
            parse_result_response(
                "p",
                &json!({"errorId": 12, "errorCode": "ERROR_CAPTCHA_UNSOLVABLE"})
            )
            .unwrap(),
            PollStatus::Failed(reason) if reason == "ERROR_CAPTCHA_UNSOLVABLE"
        ));
    }
}
