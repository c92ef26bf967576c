use crate::error::{ApiError, ApiResult};
use crate::optimistic::{EntityId, VoteBackend, VoteState};
use crate::protocol::{
    Credentials, FeedbackDraft, FeedbackItem, MAX_FEEDBACK_LEN, MAX_PAGE_SIZE, MIN_PASSWORD_LEN,
    TokenResponse, UpvoteResponse, UserInfo,
};
use crate::token::Credential;
use crate::transport::TransportGuard;
use reqwest::Method;
use std::future::Future;

/// Typed client for the feedback server. All calls go through the
/// [`TransportGuard`], so a rejected credential is cleared wherever it shows up.
pub struct ApiClient {
    transport: TransportGuard,
}

impl ApiClient {
    pub fn new(transport: TransportGuard) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &TransportGuard {
        &self.transport
    }

    /// Create an account. The server does not log the new user in.
    pub async fn register(&self, email: &str, password: &str) -> ApiResult<UserInfo> {
        validate_email(email)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(ApiError::Invalid {
                message: format!("password must be at least {MIN_PASSWORD_LEN} characters"),
            });
        }
        let req = self
            .transport
            .request(Method::POST, "/auth/register")
            .json(&Credentials { email, password });
        self.transport.send_json(req).await
    }

    /// Exchange email and password for a bearer credential.
    pub async fn login(&self, email: &str, password: &str) -> ApiResult<Credential> {
        validate_email(email)?;
        if password.is_empty() {
            return Err(ApiError::Invalid {
                message: "password is required".to_string(),
            });
        }
        let req = self
            .transport
            .request(Method::POST, "/auth/login")
            .json(&Credentials { email, password });
        let token: TokenResponse = self.transport.send_json(req).await?;
        if !token.token_type.eq_ignore_ascii_case("bearer") {
            return Err(ApiError::Decode {
                message: format!("unsupported token type {}", token.token_type),
            });
        }
        Ok(Credential::new(token.access_token))
    }

    /// The account the stored credential belongs to.
    pub async fn me(&self) -> ApiResult<UserInfo> {
        let req = self.transport.request(Method::GET, "/auth/me");
        self.transport.send_json(req).await
    }

    /// One page of the board, most upvoted first.
    pub async fn list_feedback(&self, skip: u32, limit: u32) -> ApiResult<Vec<FeedbackItem>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let req = self
            .transport
            .request(Method::GET, "/feedback/")
            .query(&[("skip", skip), ("limit", limit)]);
        self.transport.send_json(req).await
    }

    /// One page of entries written by the logged-in user.
    pub async fn my_feedback(&self, skip: u32, limit: u32) -> ApiResult<Vec<FeedbackItem>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let req = self
            .transport
            .request(Method::GET, "/feedback/my")
            .query(&[("skip", skip), ("limit", limit)]);
        self.transport.send_json(req).await
    }

    pub async fn create_feedback(&self, text: &str) -> ApiResult<FeedbackItem> {
        validate_text(text)?;
        let req = self
            .transport
            .request(Method::POST, "/feedback/")
            .json(&FeedbackDraft { text });
        self.transport.send_json(req).await
    }

    /// Replace the text of an entry. Only its author may do this.
    pub async fn update_feedback(&self, id: &EntityId, text: &str) -> ApiResult<FeedbackItem> {
        validate_text(text)?;
        let req = self
            .transport
            .request(Method::PUT, &format!("/feedback/{id}"))
            .json(&FeedbackDraft { text });
        self.transport.send_json(req).await
    }

    /// Delete an entry. Only its author may do this; the server answers 204.
    pub async fn delete_feedback(&self, id: &EntityId) -> ApiResult<()> {
        let req = self
            .transport
            .request(Method::DELETE, &format!("/feedback/{id}"));
        self.transport.send(req).await?;
        Ok(())
    }

    pub async fn feedback(&self, id: &EntityId) -> ApiResult<FeedbackItem> {
        let req = self
            .transport
            .request(Method::GET, &format!("/feedback/{id}"));
        self.transport.send_json(req).await
    }

    /// Toggle the caller's upvote on an entry.
    pub async fn toggle_upvote(&self, id: &EntityId) -> ApiResult<UpvoteResponse> {
        let req = self
            .transport
            .request(Method::POST, &format!("/feedback/{id}/upvote"));
        self.transport.send_json(req).await
    }
}

impl VoteBackend for ApiClient {
    fn toggle_vote(&self, id: &EntityId) -> impl Future<Output = ApiResult<VoteState>> + Send {
        async move { Ok(self.toggle_upvote(id).await?.vote_state()) }
    }
}

fn validate_email(email: &str) -> ApiResult<()> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty(),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ApiError::Invalid {
            message: format!("not a valid email address: {email}"),
        })
    }
}

fn validate_text(text: &str) -> ApiResult<()> {
    if text.trim().is_empty() {
        return Err(ApiError::Invalid {
            message: "feedback text is empty".to_string(),
        });
    }
    let len = text.chars().count();
    if len > MAX_FEEDBACK_LEN {
        return Err(ApiError::Invalid {
            message: format!("feedback text is {len} characters, the limit is {MAX_FEEDBACK_LEN}"),
        });
    }
    Ok(())
}
