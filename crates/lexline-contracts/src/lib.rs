use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const API_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Lawyer,
    Customer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Lawyer => "lawyer",
            Role::Customer => "customer",
        }
    }

    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "admin" => Some(Role::Admin),
            "lawyer" => Some(Role::Lawyer),
            "customer" => Some(Role::Customer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    Active,
    Pending,
    Suspended,
}

impl UserStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UserStatus::Active => "ACTIVE",
            UserStatus::Pending => "PENDING",
            UserStatus::Suspended => "SUSPENDED",
        }
    }

    pub fn parse(value: &str) -> Option<UserStatus> {
        match value {
            "ACTIVE" => Some(UserStatus::Active),
            "PENDING" => Some(UserStatus::Pending),
            "SUSPENDED" => Some(UserStatus::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Basic,
    Plus,
    Premium,
}

impl PlanTier {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanTier::Basic => "basic",
            PlanTier::Plus => "plus",
            PlanTier::Premium => "premium",
        }
    }

    pub fn parse(value: &str) -> Option<PlanTier> {
        match value {
            "basic" => Some(PlanTier::Basic),
            "plus" => Some(PlanTier::Plus),
            "premium" => Some(PlanTier::Premium),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsultationStatus {
    Requested,
    Accepted,
    Rejected,
    InProgress,
    Finished,
    Cancelled,
}

impl ConsultationStatus {
    pub const ALL: [ConsultationStatus; 6] = [
        ConsultationStatus::Requested,
        ConsultationStatus::Accepted,
        ConsultationStatus::Rejected,
        ConsultationStatus::InProgress,
        ConsultationStatus::Finished,
        ConsultationStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConsultationStatus::Requested => "REQUESTED",
            ConsultationStatus::Accepted => "ACCEPTED",
            ConsultationStatus::Rejected => "REJECTED",
            ConsultationStatus::InProgress => "IN_PROGRESS",
            ConsultationStatus::Finished => "FINISHED",
            ConsultationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<ConsultationStatus> {
        match value {
            "REQUESTED" => Some(ConsultationStatus::Requested),
            "ACCEPTED" => Some(ConsultationStatus::Accepted),
            "REJECTED" => Some(ConsultationStatus::Rejected),
            "IN_PROGRESS" => Some(ConsultationStatus::InProgress),
            "FINISHED" => Some(ConsultationStatus::Finished),
            "CANCELLED" => Some(ConsultationStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConsultationStatus::Rejected
                | ConsultationStatus::Finished
                | ConsultationStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ConsultationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted user. The bearer token is never serialized into responses;
/// auth endpoints return it separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub role: Role,
    pub status: UserStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_expires_at: Option<DateTime<Utc>>,
    pub is_on_trial: bool,
    #[serde(skip_serializing, default)]
    pub token: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsultationRecord {
    pub id: String,
    pub customer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lawyer_id: Option<String>,
    pub status: ConsultationStatus,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub response_by: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_duration_minutes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub consultation_id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub delivered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// The authenticated principal. Resolved once per request/connection from
/// a bearer token; commands only ever see this, not raw credentials.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: String,
    pub email: String,
    pub role: Role,
    pub status: UserStatus,
    pub plan: Option<PlanTier>,
}

/// Raw quota check result; `limit == -1` is the unlimited sentinel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub has_quota: bool,
    pub used: i64,
    pub limit: i64,
}

/// Customer-facing quota view; `null` limit/remaining signals unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaView {
    pub used: i64,
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub is_unlimited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyView {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// A consultation plus the contact cards a party with standing may see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsultationView {
    #[serde(flatten)]
    pub consultation: ConsultationRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<PartyView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lawyer: Option<PartyView>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub plan: Option<PlanTier>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub user: UserRecord,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateConsultationRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Legacy alias for `description`; first non-empty of the two wins.
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub lawyer_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateConsultationResponse {
    pub data: ConsultationView,
    pub quota: QuotaSnapshot,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanChangeRequest {
    pub plan: PlanTier,
    #[serde(default)]
    pub plan_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrialRequest {
    pub days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub pages: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Client-originated live-channel events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinConsultation {
        consultation_id: String,
    },
    AcceptConsultation {
        consultation_id: String,
    },
    RejectConsultation {
        consultation_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    SendMessage {
        consultation_id: String,
        #[serde(default)]
        text: Option<String>,
        /// Legacy alias for `text`.
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        attachments: Vec<String>,
    },
    EndConsultation {
        consultation_id: String,
    },
    Typing {
        consultation_id: String,
    },
    StoppedTyping {
        consultation_id: String,
    },
    LeaveConsultation {
        consultation_id: String,
    },
}

/// Server-originated live-channel events. Everything except the direct
/// acknowledgements (`joined_consultation`, `message_delivered`) is scoped
/// to the consultation's channel membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    JoinedConsultation {
        consultation_id: String,
    },
    UserJoined {
        user_id: String,
        email: String,
        role: Role,
    },
    UserLeft {
        user_id: String,
        email: String,
    },
    ConsultationAccepted {
        consultation: ConsultationRecord,
    },
    ConsultationRejected {
        consultation: ConsultationRecord,
        #[serde(default)]
        reason: Option<String>,
    },
    NewMessage {
        message: MessageRecord,
    },
    MessageDelivered {
        message_id: String,
        delivered_at: DateTime<Utc>,
    },
    SessionEnded {
        consultation_id: String,
        reason: String,
        duration_minutes: i64,
    },
    UserTyping {
        user_id: String,
        email: String,
    },
    UserStoppedTyping {
        user_id: String,
        email: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsultationMetrics {
    pub average_response_time_hours: f64,
    pub pending_count: i64,
    pub sla_breaches: i64,
    pub by_status: BTreeMap<ConsultationStatus, i64>,
    pub average_session_duration_minutes: i64,
    pub trend: Vec<TrendPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMetrics {
    pub by_role: BTreeMap<Role, i64>,
    pub pending_lawyers: i64,
    pub customers_by_plan: BTreeMap<PlanTier, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub consultations: ConsultationMetrics,
    pub users: UserMetrics,
}
