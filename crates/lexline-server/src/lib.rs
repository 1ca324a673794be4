use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{Duration, Local, Utc};
use lexline_config::Config;
use lexline_contracts::{
    Actor, AuthResponse, ConsultationRecord, ConsultationStatus, ConsultationView,
    CreateConsultationRequest, CreateConsultationResponse, LoginRequest, MessageRecord, Paginated,
    Pagination, PartyView, PlanChangeRequest, QuotaView, RegisterRequest, RejectRequest, Role,
    ServerEvent, TrialRequest, UserRecord, UserStatus,
};
use lexline_kernel::{
    accept_transition, can_view, cancel_transition, evaluate_quota, finish_transition, list_filter,
    message_guard, metrics_snapshot, month_start, quota_denied, quota_view, reject_transition,
    response_deadline, UserFilter, DEFAULT_TITLE,
};
use serde::Deserialize;
use tokio::sync::Mutex;
use uuid::Uuid;

mod error;
mod live;
mod store;

pub use error::ApiError;
pub use live::{ChannelMessage, ChannelRegistry, LiveSession, LiveSessionRegistry};
use store::{StoreBackend, TransitionOutcome};

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub fn build_app(cfg: Config) -> Result<Router, String> {
    Ok(router(AppState::new(cfg)?))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/auth/register", post(register))
        .route("/v1/auth/login", post(login))
        .route(
            "/v1/consultations",
            post(create_consultation).get(list_consultations),
        )
        .route("/v1/consultations/quota", get(quota))
        .route("/v1/consultations/ws", get(live::ws_handler))
        .route("/v1/consultations/{id}", get(get_consultation))
        .route("/v1/consultations/{id}/messages", get(list_messages))
        .route("/v1/consultations/{id}/accept", post(accept_consultation))
        .route("/v1/consultations/{id}/reject", post(reject_consultation))
        .route("/v1/consultations/{id}/cancel", post(cancel_consultation))
        .route("/v1/admin/users", get(admin_list_users))
        .route("/v1/admin/lawyers/pending", get(admin_pending_lawyers))
        .route("/v1/admin/lawyers/{id}/approve", post(admin_approve_lawyer))
        .route("/v1/admin/lawyers/{id}/reject", post(admin_reject_lawyer))
        .route("/v1/admin/users/{id}/suspend", put(admin_suspend_user))
        .route("/v1/admin/users/{id}/activate", put(admin_activate_user))
        .route("/v1/admin/users/{id}/plan", put(admin_change_plan))
        .route("/v1/admin/users/{id}/trial", put(admin_grant_trial))
        .route("/v1/admin/consultations", get(admin_list_consultations))
        .route("/v1/admin/metrics", get(admin_metrics))
        .with_state(state)
}

#[derive(Clone)]
pub struct AppState {
    cfg: Config,
    store: Arc<Mutex<StoreBackend>>,
    pub channels: Arc<ChannelRegistry>,
    pub sessions: Arc<LiveSessionRegistry>,
}

fn prefixed_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

fn actor_of(user: &UserRecord) -> Actor {
    Actor {
        id: user.id.clone(),
        email: user.email.clone(),
        role: user.role,
        status: user.status,
        plan: user.plan,
    }
}

fn conflict(current: ConsultationStatus) -> ApiError {
    ApiError::StateConflict {
        message: format!("consultation was already handled (currently {current})"),
        current_status: current,
    }
}

impl AppState {
    pub fn new(cfg: Config) -> Result<Self, String> {
        let store = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            StoreBackend::Sqlite(store::SqliteStore::new(&sqlite_path)?)
        } else {
            StoreBackend::Memory(store::MemoryStore::default())
        };
        Ok(Self {
            cfg,
            store: Arc::new(Mutex::new(store)),
            channels: Arc::new(ChannelRegistry::default()),
            sessions: Arc::new(LiveSessionRegistry::default()),
        })
    }

    /// Token → principal. The configured admin token authenticates a
    /// synthetic admin without a user record (bootstrap).
    pub async fn authenticate(&self, token: &str) -> Result<Actor, ApiError> {
        if token == self.cfg.auth.admin_token {
            return Ok(Actor {
                id: "usr_admin".to_string(),
                email: "admin@lexline.local".to_string(),
                role: Role::Admin,
                status: UserStatus::Active,
                plan: None,
            });
        }
        let store = self.store.lock().await;
        let user = store.user_by_token(token)?.ok_or(ApiError::InvalidToken)?;
        drop(store);
        if user.status == UserStatus::Suspended {
            return Err(ApiError::AccessDenied("account is suspended".to_string()));
        }
        Ok(actor_of(&user))
    }

    pub async fn register(&self, req: RegisterRequest) -> Result<AuthResponse, ApiError> {
        let email = req.email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(ApiError::Validation("a valid email is required".to_string()));
        }
        if req.role == Role::Admin {
            return Err(ApiError::Validation(
                "role must be customer or lawyer".to_string(),
            ));
        }
        let mut store = self.store.lock().await;
        if store.user_by_email(&email)?.is_some() {
            return Err(ApiError::Validation("email already registered".to_string()));
        }
        // Lawyers wait for admin approval; customers are live immediately.
        let (status, plan) = match req.role {
            Role::Lawyer => (UserStatus::Pending, None),
            _ => (
                UserStatus::Active,
                Some(req.plan.unwrap_or(lexline_contracts::PlanTier::Basic)),
            ),
        };
        let user = UserRecord {
            id: prefixed_id("usr"),
            email,
            phone: req.phone,
            role: req.role,
            status,
            plan,
            plan_expires_at: None,
            trial_expires_at: None,
            is_on_trial: false,
            token: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        };
        store.insert_user(&user)?;
        drop(store);
        tracing::info!(user_id = %user.id, role = user.role.as_str(), "user registered");
        Ok(AuthResponse {
            token: user.token.clone(),
            user,
        })
    }

    pub async fn login(&self, req: LoginRequest) -> Result<AuthResponse, ApiError> {
        let email = req.email.trim().to_lowercase();
        let store = self.store.lock().await;
        let user = store.user_by_email(&email)?.ok_or(ApiError::InvalidToken)?;
        drop(store);
        if user.status == UserStatus::Suspended {
            return Err(ApiError::AccessDenied("account is suspended".to_string()));
        }
        Ok(AuthResponse {
            token: user.token.clone(),
            user,
        })
    }

    pub async fn create_consultation(
        &self,
        actor: &Actor,
        req: CreateConsultationRequest,
    ) -> Result<CreateConsultationResponse, ApiError> {
        if actor.role != Role::Customer {
            return Err(ApiError::AccessDenied(
                "only customers can open consultations".to_string(),
            ));
        }
        let description = [req.description, req.question]
            .into_iter()
            .flatten()
            .map(|s| s.trim().to_string())
            .find(|s| !s.is_empty())
            .ok_or_else(|| ApiError::Validation("description is required".to_string()))?;
        let title = req
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());

        let now = Utc::now();
        // Quota windows follow the local server clock.
        let since = month_start(Local::now()).with_timezone(&Utc);

        let mut store = self.store.lock().await;
        let used = store.count_monthly_active(&actor.id, since)?;
        let quota = match actor.plan {
            Some(plan) => evaluate_quota(plan, used),
            None => quota_denied(),
        };
        if !quota.has_quota {
            return Err(ApiError::QuotaExceeded { quota });
        }

        if let Some(lawyer_id) = &req.lawyer_id {
            let candidate = store.user_by_id(lawyer_id)?;
            let valid = candidate
                .map(|u| u.role == Role::Lawyer && u.status == UserStatus::Active)
                .unwrap_or(false);
            if !valid {
                return Err(ApiError::Validation(
                    "lawyer_id does not reference an active lawyer".to_string(),
                ));
            }
        }
        // A pre-selected lawyer skips the pool: the consultation starts
        // accepted with the session clock primed.
        let (status, lawyer_id, start_at) = match req.lawyer_id {
            Some(id) => (ConsultationStatus::Accepted, Some(id), Some(now)),
            None => (ConsultationStatus::Requested, None, None),
        };

        let consultation = ConsultationRecord {
            id: prefixed_id("con"),
            customer_id: actor.id.clone(),
            lawyer_id,
            status,
            title,
            description: description.clone(),
            attachments: req.attachments.clone(),
            response_by: response_deadline(now, self.cfg.sla.response_hours),
            start_at,
            end_at: None,
            last_activity_at: None,
            rejection_reason: None,
            session_duration_minutes: None,
            created_at: now,
        };
        store.insert_consultation(&consultation)?;

        // The opening question doubles as the first chat message.
        let message = MessageRecord {
            id: prefixed_id("msg"),
            consultation_id: consultation.id.clone(),
            sender_id: actor.id.clone(),
            text: description,
            attachments: req.attachments,
            delivered_at: now,
            read_at: None,
            created_at: now,
        };
        store.insert_message(&message)?;

        let view = build_view(&store, consultation)?;
        let quota_after = match actor.plan {
            Some(plan) => evaluate_quota(plan, used + 1),
            None => quota,
        };
        drop(store);
        tracing::info!(
            consultation_id = %view.consultation.id,
            "consultation created; notifying available lawyers"
        );
        Ok(CreateConsultationResponse {
            data: view,
            quota: quota_after,
        })
    }

    pub async fn list_consultations(
        &self,
        actor: &Actor,
        status: Option<ConsultationStatus>,
        page: i64,
        limit: i64,
    ) -> Result<Paginated<ConsultationView>, ApiError> {
        let filter = list_filter(actor, status);
        let store = self.store.lock().await;
        let (records, total) = store.list_consultations(&filter, page, limit)?;
        let mut data = Vec::with_capacity(records.len());
        for record in records {
            data.push(build_view(&store, record)?);
        }
        drop(store);
        Ok(paginated(data, total, page, limit))
    }

    pub async fn get_consultation(
        &self,
        actor: &Actor,
        id: &str,
    ) -> Result<ConsultationView, ApiError> {
        let store = self.store.lock().await;
        let record = store
            .consultation_by_id(id)?
            .ok_or(ApiError::NotFound("consultation"))?;
        if !can_view(actor, &record) {
            return Err(ApiError::AccessDenied(
                "no standing on this consultation".to_string(),
            ));
        }
        Ok(build_view(&store, record)?)
    }

    pub async fn quota_status(&self, actor: &Actor) -> Result<QuotaView, ApiError> {
        if actor.role != Role::Customer {
            return Err(ApiError::AccessDenied(
                "quota applies to customers".to_string(),
            ));
        }
        let since = month_start(Local::now()).with_timezone(&Utc);
        let store = self.store.lock().await;
        let used = store.count_monthly_active(&actor.id, since)?;
        drop(store);
        let snapshot = match actor.plan {
            Some(plan) => evaluate_quota(plan, used),
            None => quota_denied(),
        };
        Ok(quota_view(&snapshot))
    }

    pub async fn list_messages(
        &self,
        actor: &Actor,
        id: &str,
    ) -> Result<Vec<MessageRecord>, ApiError> {
        let store = self.store.lock().await;
        let record = store
            .consultation_by_id(id)?
            .ok_or(ApiError::NotFound("consultation"))?;
        if !can_view(actor, &record) {
            return Err(ApiError::AccessDenied(
                "no standing on this consultation".to_string(),
            ));
        }
        Ok(store.list_messages(id)?)
    }

    /// Visibility gate for joining a consultation's live channel; same
    /// standing rule as the single-record read.
    pub async fn check_join(&self, actor: &Actor, id: &str) -> Result<(), ApiError> {
        let store = self.store.lock().await;
        let record = store
            .consultation_by_id(id)?
            .ok_or(ApiError::NotFound("consultation"))?;
        if !can_view(actor, &record) {
            return Err(ApiError::AccessDenied(
                "no standing on this consultation".to_string(),
            ));
        }
        Ok(())
    }

    /// Shared by the sync API (`live = false` → ACCEPTED) and the live
    /// channel (`live = true` → IN_PROGRESS plus a tracked session). The
    /// store applies the patch only if the record is still REQUESTED, so
    /// racing lawyers get exactly one winner.
    pub async fn accept_consultation(
        &self,
        actor: &Actor,
        id: &str,
        live: bool,
    ) -> Result<ConsultationRecord, ApiError> {
        let now = Utc::now();
        let mut store = self.store.lock().await;
        let record = store
            .consultation_by_id(id)?
            .ok_or(ApiError::NotFound("consultation"))?;
        let transition = accept_transition(actor, &record, live, now)?;
        match store.apply_transition(id, &transition)? {
            TransitionOutcome::Applied(updated) => {
                self.channels.publish(
                    id,
                    None,
                    ServerEvent::ConsultationAccepted {
                        consultation: updated.clone(),
                    },
                );
                if live {
                    self.sessions
                        .start(id, now, self.cfg.session.max_duration_minutes);
                }
                drop(store);
                tracing::info!(consultation_id = id, lawyer_id = %actor.id, live, "consultation accepted; notifying customer");
                Ok(updated)
            }
            TransitionOutcome::Conflict(current) => Err(conflict(current)),
            TransitionOutcome::NotFound => Err(ApiError::NotFound("consultation")),
        }
    }

    pub async fn reject_consultation(
        &self,
        actor: &Actor,
        id: &str,
        reason: Option<String>,
    ) -> Result<ConsultationRecord, ApiError> {
        let mut store = self.store.lock().await;
        let record = store
            .consultation_by_id(id)?
            .ok_or(ApiError::NotFound("consultation"))?;
        let transition = reject_transition(actor, &record, reason)?;
        match store.apply_transition(id, &transition)? {
            TransitionOutcome::Applied(updated) => {
                self.channels.publish(
                    id,
                    None,
                    ServerEvent::ConsultationRejected {
                        consultation: updated.clone(),
                        reason: updated.rejection_reason.clone(),
                    },
                );
                self.channels.remove(id);
                drop(store);
                tracing::info!(consultation_id = id, lawyer_id = %actor.id, "consultation rejected; notifying customer");
                Ok(updated)
            }
            TransitionOutcome::Conflict(current) => Err(conflict(current)),
            TransitionOutcome::NotFound => Err(ApiError::NotFound("consultation")),
        }
    }

    pub async fn cancel_consultation(
        &self,
        actor: &Actor,
        id: &str,
    ) -> Result<ConsultationRecord, ApiError> {
        let mut store = self.store.lock().await;
        let record = store
            .consultation_by_id(id)?
            .ok_or(ApiError::NotFound("consultation"))?;
        let transition = cancel_transition(actor, &record)?;
        match store.apply_transition(id, &transition)? {
            TransitionOutcome::Applied(updated) => {
                self.channels.remove(id);
                drop(store);
                tracing::info!(consultation_id = id, "consultation cancelled by customer");
                Ok(updated)
            }
            TransitionOutcome::Conflict(current) => Err(conflict(current)),
            TransitionOutcome::NotFound => Err(ApiError::NotFound("consultation")),
        }
    }

    pub async fn end_consultation(
        &self,
        actor: &Actor,
        id: &str,
        reason: &str,
    ) -> Result<ConsultationRecord, ApiError> {
        let now = Utc::now();
        let mut store = self.store.lock().await;
        let record = store
            .consultation_by_id(id)?
            .ok_or(ApiError::NotFound("consultation"))?;
        let transition = finish_transition(actor, &record, now)?;
        match store.apply_transition(id, &transition)? {
            TransitionOutcome::Applied(updated) => {
                self.sessions.remove(id);
                self.channels.publish(
                    id,
                    None,
                    ServerEvent::SessionEnded {
                        consultation_id: id.to_string(),
                        reason: reason.to_string(),
                        duration_minutes: updated.session_duration_minutes.unwrap_or(0),
                    },
                );
                self.channels.remove(id);
                drop(store);
                tracing::info!(
                    consultation_id = id,
                    duration_minutes = updated.session_duration_minutes.unwrap_or(0),
                    "session ended"
                );
                Ok(updated)
            }
            TransitionOutcome::Conflict(current) => Err(conflict(current)),
            TransitionOutcome::NotFound => Err(ApiError::NotFound("consultation")),
        }
    }

    pub async fn send_message(
        &self,
        actor: &Actor,
        id: &str,
        text: &str,
        attachments: Vec<String>,
    ) -> Result<MessageRecord, ApiError> {
        let now = Utc::now();
        let mut store = self.store.lock().await;
        let record = store
            .consultation_by_id(id)?
            .ok_or(ApiError::NotFound("consultation"))?;
        let trimmed = message_guard(actor, &record, text)?;
        let message = MessageRecord {
            id: prefixed_id("msg"),
            consultation_id: id.to_string(),
            sender_id: actor.id.clone(),
            text: trimmed,
            attachments,
            delivered_at: now,
            read_at: None,
            created_at: now,
        };
        store.insert_message(&message)?;
        store.touch_last_activity(id, now)?;
        if record.status == ConsultationStatus::InProgress {
            self.sessions.touch(id, now);
        }
        self.channels.publish(
            id,
            None,
            ServerEvent::NewMessage {
                message: message.clone(),
            },
        );
        Ok(message)
    }

    pub async fn metrics(&self, actor: &Actor) -> Result<lexline_contracts::MetricsSnapshot, ApiError> {
        require_admin(actor)?;
        let store = self.store.lock().await;
        let consultations = store.all_consultations()?;
        let users = store.all_users()?;
        drop(store);
        Ok(metrics_snapshot(&consultations, &users, Utc::now()))
    }

    pub async fn list_users(
        &self,
        actor: &Actor,
        filter: UserFilter,
        page: i64,
        limit: i64,
    ) -> Result<Paginated<UserRecord>, ApiError> {
        require_admin(actor)?;
        let store = self.store.lock().await;
        let (data, total) = store.list_users(&filter, page, limit)?;
        drop(store);
        Ok(paginated(data, total, page, limit))
    }

    pub async fn approve_lawyer(&self, actor: &Actor, id: &str) -> Result<UserRecord, ApiError> {
        require_admin(actor)?;
        let mut store = self.store.lock().await;
        let mut user = store.user_by_id(id)?.ok_or(ApiError::NotFound("user"))?;
        if user.role != Role::Lawyer {
            return Err(ApiError::Validation("user is not a lawyer".to_string()));
        }
        if user.status != UserStatus::Pending {
            return Err(ApiError::Validation(format!(
                "lawyer is {}, only PENDING lawyers can be approved",
                user.status.as_str()
            )));
        }
        user.status = UserStatus::Active;
        store.update_user(&user)?;
        drop(store);
        tracing::info!(user_id = id, "lawyer approved");
        Ok(user)
    }

    pub async fn reject_lawyer(
        &self,
        actor: &Actor,
        id: &str,
        reason: Option<String>,
    ) -> Result<UserRecord, ApiError> {
        require_admin(actor)?;
        let mut store = self.store.lock().await;
        let mut user = store.user_by_id(id)?.ok_or(ApiError::NotFound("user"))?;
        if user.role != Role::Lawyer {
            return Err(ApiError::Validation("user is not a lawyer".to_string()));
        }
        if user.status != UserStatus::Pending {
            return Err(ApiError::Validation(format!(
                "lawyer is {}, only PENDING lawyers can be rejected",
                user.status.as_str()
            )));
        }
        user.status = UserStatus::Suspended;
        store.update_user(&user)?;
        drop(store);
        tracing::info!(
            user_id = id,
            reason = reason.as_deref().unwrap_or(""),
            "lawyer application rejected"
        );
        Ok(user)
    }

    pub async fn suspend_user(&self, actor: &Actor, id: &str) -> Result<UserRecord, ApiError> {
        require_admin(actor)?;
        let mut store = self.store.lock().await;
        let mut user = store.user_by_id(id)?.ok_or(ApiError::NotFound("user"))?;
        if user.role == Role::Admin {
            return Err(ApiError::AccessDenied(
                "admins cannot be suspended".to_string(),
            ));
        }
        user.status = UserStatus::Suspended;
        store.update_user(&user)?;
        drop(store);
        tracing::info!(user_id = id, "user suspended");
        Ok(user)
    }

    pub async fn activate_user(&self, actor: &Actor, id: &str) -> Result<UserRecord, ApiError> {
        require_admin(actor)?;
        let mut store = self.store.lock().await;
        let mut user = store.user_by_id(id)?.ok_or(ApiError::NotFound("user"))?;
        if user.role == Role::Admin {
            return Err(ApiError::AccessDenied(
                "admin accounts are not managed here".to_string(),
            ));
        }
        user.status = UserStatus::Active;
        store.update_user(&user)?;
        drop(store);
        tracing::info!(user_id = id, "user activated");
        Ok(user)
    }

    pub async fn change_plan(
        &self,
        actor: &Actor,
        id: &str,
        req: PlanChangeRequest,
    ) -> Result<UserRecord, ApiError> {
        require_admin(actor)?;
        let mut store = self.store.lock().await;
        let mut user = store.user_by_id(id)?.ok_or(ApiError::NotFound("user"))?;
        if user.role != Role::Customer {
            return Err(ApiError::Validation(
                "plan changes apply to customers only".to_string(),
            ));
        }
        user.plan = Some(req.plan);
        user.plan_expires_at = req.plan_expires_at;
        store.update_user(&user)?;
        drop(store);
        tracing::info!(user_id = id, plan = req.plan.as_str(), "plan changed");
        Ok(user)
    }

    pub async fn grant_trial(
        &self,
        actor: &Actor,
        id: &str,
        req: TrialRequest,
    ) -> Result<UserRecord, ApiError> {
        require_admin(actor)?;
        if !(1..=90).contains(&req.days) {
            return Err(ApiError::Validation(
                "days must be between 1 and 90".to_string(),
            ));
        }
        let mut store = self.store.lock().await;
        let mut user = store.user_by_id(id)?.ok_or(ApiError::NotFound("user"))?;
        if user.role != Role::Customer {
            return Err(ApiError::Validation(
                "trials apply to customers only".to_string(),
            ));
        }
        user.is_on_trial = true;
        user.trial_expires_at = Some(Utc::now() + Duration::days(req.days));
        store.update_user(&user)?;
        drop(store);
        tracing::info!(user_id = id, days = req.days, "trial granted");
        Ok(user)
    }
}

fn require_admin(actor: &Actor) -> Result<(), ApiError> {
    if actor.role == Role::Admin {
        Ok(())
    } else {
        Err(ApiError::AccessDenied("admin only".to_string()))
    }
}

/// Contact cards for parties with standing: the customer's email/phone and
/// the lawyer's email.
fn build_view(
    store: &StoreBackend,
    consultation: ConsultationRecord,
) -> Result<ConsultationView, ApiError> {
    let customer = store
        .user_by_id(&consultation.customer_id)?
        .map(|u| PartyView {
            id: u.id,
            email: u.email,
            phone: u.phone,
        });
    let lawyer = match &consultation.lawyer_id {
        Some(id) => store.user_by_id(id)?.map(|u| PartyView {
            id: u.id,
            email: u.email,
            phone: None,
        }),
        None => None,
    };
    Ok(ConsultationView {
        consultation,
        customer,
        lawyer,
    })
}

fn paginated<T>(data: Vec<T>, total: i64, page: i64, limit: i64) -> Paginated<T> {
    let pages = if total == 0 { 0 } else { (total + limit - 1) / limit };
    Paginated {
        data,
        pagination: Pagination {
            total,
            page,
            limit,
            pages,
        },
    }
}

fn paging(page: Option<i64>, limit: Option<i64>) -> (i64, i64) {
    (page.unwrap_or(1).max(1), limit.unwrap_or(20).clamp(1, 100))
}

fn parse_status(value: Option<&str>) -> Result<Option<ConsultationStatus>, ApiError> {
    match value {
        None => Ok(None),
        Some(raw) => ConsultationStatus::parse(raw)
            .map(Some)
            .ok_or_else(|| ApiError::Validation(format!("unknown status: {raw}"))),
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(ApiError::AuthenticationRequired)?;
    let value = value.to_str().map_err(|_| ApiError::InvalidToken)?;
    value
        .strip_prefix("Bearer ")
        .ok_or(ApiError::InvalidToken)
}

async fn actor_from(state: &AppState, headers: &HeaderMap) -> Result<Actor, ApiError> {
    state.authenticate(bearer_token(headers)?).await
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), ApiError> {
    state
        .register(req)
        .await
        .map(|resp| (StatusCode::CREATED, Json(resp)))
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    state.login(req).await.map(Json)
}

async fn create_consultation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateConsultationRequest>,
) -> Result<(StatusCode, Json<CreateConsultationResponse>), ApiError> {
    let actor = actor_from(&state, &headers).await?;
    state
        .create_consultation(&actor, req)
        .await
        .map(|resp| (StatusCode::CREATED, Json(resp)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn list_consultations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Paginated<ConsultationView>>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    let status = parse_status(query.status.as_deref())?;
    let (page, limit) = paging(query.page, query.limit);
    state
        .list_consultations(&actor, status, page, limit)
        .await
        .map(Json)
}

async fn quota(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<QuotaView>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    state.quota_status(&actor).await.map(Json)
}

async fn get_consultation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ConsultationView>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    state.get_consultation(&actor, &id).await.map(Json)
}

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<MessageRecord>>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    state.list_messages(&actor, &id).await.map(Json)
}

async fn accept_consultation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ConsultationRecord>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    state.accept_consultation(&actor, &id, false).await.map(Json)
}

async fn reject_consultation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<RejectRequest>,
) -> Result<Json<ConsultationRecord>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    state
        .reject_consultation(&actor, &id, req.reason)
        .await
        .map(Json)
}

async fn cancel_consultation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ConsultationRecord>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    state.cancel_consultation(&actor, &id).await.map(Json)
}

#[derive(Debug, Deserialize)]
struct UserListQuery {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn admin_list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UserListQuery>,
) -> Result<Json<Paginated<UserRecord>>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    let filter = UserFilter {
        role: query
            .role
            .as_deref()
            .map(|v| Role::parse(v).ok_or_else(|| ApiError::Validation(format!("unknown role: {v}"))))
            .transpose()?,
        status: query
            .status
            .as_deref()
            .map(|v| {
                UserStatus::parse(v)
                    .ok_or_else(|| ApiError::Validation(format!("unknown status: {v}")))
            })
            .transpose()?,
        plan: query
            .plan
            .as_deref()
            .map(|v| {
                lexline_contracts::PlanTier::parse(v)
                    .ok_or_else(|| ApiError::Validation(format!("unknown plan: {v}")))
            })
            .transpose()?,
    };
    let (page, limit) = paging(query.page, query.limit);
    state.list_users(&actor, filter, page, limit).await.map(Json)
}

async fn admin_pending_lawyers(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Paginated<UserRecord>>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    let filter = UserFilter {
        role: Some(Role::Lawyer),
        status: Some(UserStatus::Pending),
        plan: None,
    };
    let (page, limit) = paging(query.page, query.limit);
    state.list_users(&actor, filter, page, limit).await.map(Json)
}

async fn admin_approve_lawyer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<UserRecord>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    state.approve_lawyer(&actor, &id).await.map(Json)
}

async fn admin_reject_lawyer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<RejectRequest>,
) -> Result<Json<UserRecord>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    state.reject_lawyer(&actor, &id, req.reason).await.map(Json)
}

async fn admin_suspend_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<UserRecord>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    state.suspend_user(&actor, &id).await.map(Json)
}

async fn admin_activate_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<UserRecord>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    state.activate_user(&actor, &id).await.map(Json)
}

async fn admin_change_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<PlanChangeRequest>,
) -> Result<Json<UserRecord>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    state.change_plan(&actor, &id, req).await.map(Json)
}

async fn admin_grant_trial(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<TrialRequest>,
) -> Result<Json<UserRecord>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    state.grant_trial(&actor, &id, req).await.map(Json)
}

async fn admin_list_consultations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Paginated<ConsultationView>>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    require_admin(&actor)?;
    let status = parse_status(query.status.as_deref())?;
    let (page, limit) = paging(query.page, query.limit);
    state
        .list_consultations(&actor, status, page, limit)
        .await
        .map(Json)
}

async fn admin_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<lexline_contracts::MetricsSnapshot>, ApiError> {
    let actor = actor_from(&state, &headers).await?;
    state.metrics(&actor).await.map(Json)
}
