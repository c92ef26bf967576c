use crate::optimistic::{Entity, EntityId, VoteState};
use serde::{Deserialize, Serialize};

/// Minimum password length accepted by the server at registration.
pub const MIN_PASSWORD_LEN: usize = 8;
/// Largest page the server will return from the list endpoint.
pub const MAX_PAGE_SIZE: u32 = 100;
/// Longest feedback text the server stores, in characters.
pub const MAX_FEEDBACK_LEN: usize = 1000;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Body of `POST /auth/login` and `POST /auth/register`.
#[derive(Serialize)]
pub struct Credentials<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Body of `POST /feedback/` and `PUT /feedback/{id}`.
#[derive(Serialize)]
pub struct FeedbackDraft<'a> {
    pub text: &'a str,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// `POST /auth/login`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// `POST /auth/register` and `GET /auth/me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: i64,
    pub email: String,
    pub is_active: bool,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// An entry on the feedback board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackItem {
    pub id: i64,
    pub text: String,
    pub upvotes: i64,
    pub user_id: i64,
    pub user_email: String,
    #[serde(default)]
    pub has_upvoted: bool,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl From<&FeedbackItem> for Entity {
    fn from(item: &FeedbackItem) -> Self {
        Entity::new(
            EntityId::from(item.id),
            VoteState {
                vote_count: item.upvotes.max(0) as u64,
                viewer_has_voted: item.has_upvoted,
            },
        )
    }
}

/// `POST /feedback/{id}/upvote`. The server toggles the caller's vote.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpvoteResponse {
    pub id: i64,
    pub upvotes: i64,
    pub has_upvoted: bool,
    #[serde(default)]
    pub message: String,
}

impl UpvoteResponse {
    pub fn vote_state(&self) -> VoteState {
        VoteState {
            vote_count: self.upvotes.max(0) as u64,
            viewer_has_voted: self.has_upvoted,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error envelope. `detail` is a string for handled errors and a list of
/// `{loc, msg, type}` objects for request validation failures.
#[derive(Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

/// Pull a human-readable message out of an error response body.
pub fn error_message(body: &str, fallback: &str) -> String {
    let detail = serde_json::from_str::<ErrorBody>(body).map(|b| b.detail);
    match detail {
        Ok(serde_json::Value::String(s)) if !s.is_empty() => s,
        Ok(serde_json::Value::Array(items)) => {
            let msgs: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                .collect();
            if msgs.is_empty() {
                fallback.to_string()
            } else {
                msgs.join("; ")
            }
        }
        _ if !body.trim().is_empty() && body.len() <= 512 => body.trim().to_string(),
        _ => fallback.to_string(),
    }
}
