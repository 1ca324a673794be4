use chrono::{DateTime, Utc};
use lexline_contracts::{ConsultationRecord, ConsultationStatus, MessageRecord, UserRecord};
use lexline_kernel::{
    filter_matches, user_filter_matches, ConsultationFilter, ListScope, Transition, UserFilter,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;

/// Result of a guarded status update. `Conflict` carries the status the
/// record actually had, for the 409 payload.
#[derive(Debug)]
pub enum TransitionOutcome {
    Applied(ConsultationRecord),
    Conflict(ConsultationStatus),
    NotFound,
}

#[derive(Default)]
pub struct MemoryStore {
    users: HashMap<String, UserRecord>,
    consultations: HashMap<String, ConsultationRecord>,
    messages: HashMap<String, Vec<MessageRecord>>,
}

pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

pub struct SqliteStore {
    conn: Connection,
}

fn apply_patch(record: &mut ConsultationRecord, transition: &Transition) {
    record.status = transition.to;
    if let Some(v) = &transition.patch.lawyer_id {
        record.lawyer_id = Some(v.clone());
    }
    if let Some(v) = transition.patch.start_at {
        record.start_at = Some(v);
    }
    if let Some(v) = transition.patch.end_at {
        record.end_at = Some(v);
    }
    if let Some(v) = transition.patch.last_activity_at {
        record.last_activity_at = Some(v);
    }
    if let Some(v) = &transition.patch.rejection_reason {
        record.rejection_reason = Some(v.clone());
    }
    if let Some(v) = transition.patch.session_duration_minutes {
        record.session_duration_minutes = Some(v);
    }
}

fn page_slice<T: Clone>(items: &[T], page: i64, limit: i64) -> Vec<T> {
    // Saturating: an absurdly large page is a valid request for an empty
    // page, not an arithmetic fault.
    let start = page.saturating_sub(1).saturating_mul(limit).max(0) as usize;
    items.iter().skip(start).take(limit as usize).cloned().collect()
}

impl StoreBackend {
    pub fn insert_user(&mut self, user: &UserRecord) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store.users.insert(user.id.clone(), user.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.upsert_user(user),
        }
    }

    pub fn update_user(&mut self, user: &UserRecord) -> Result<(), String> {
        self.insert_user(user)
    }

    pub fn user_by_id(&self, id: &str) -> Result<Option<UserRecord>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.users.get(id).cloned()),
            StoreBackend::Sqlite(store) => store.user_by("id", id),
        }
    }

    pub fn user_by_token(&self, token: &str) -> Result<Option<UserRecord>, String> {
        match self {
            StoreBackend::Memory(store) => {
                Ok(store.users.values().find(|u| u.token == token).cloned())
            }
            StoreBackend::Sqlite(store) => store.user_by("token", token),
        }
    }

    pub fn user_by_email(&self, email: &str) -> Result<Option<UserRecord>, String> {
        match self {
            StoreBackend::Memory(store) => {
                Ok(store.users.values().find(|u| u.email == email).cloned())
            }
            StoreBackend::Sqlite(store) => store.user_by("email", email),
        }
    }

    /// Filtered user listing, newest first, plus the unpaginated total.
    pub fn list_users(
        &self,
        filter: &UserFilter,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<UserRecord>, i64), String> {
        let mut matching: Vec<UserRecord> = match self {
            StoreBackend::Memory(store) => store
                .users
                .values()
                .filter(|u| user_filter_matches(filter, u))
                .cloned()
                .collect(),
            StoreBackend::Sqlite(store) => store.list_users(filter)?,
        };
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        let total = matching.len() as i64;
        Ok((page_slice(&matching, page, limit), total))
    }

    pub fn all_users(&self) -> Result<Vec<UserRecord>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.users.values().cloned().collect()),
            StoreBackend::Sqlite(store) => store.list_users(&UserFilter::default()),
        }
    }

    pub fn insert_consultation(&mut self, consultation: &ConsultationRecord) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .consultations
                    .insert(consultation.id.clone(), consultation.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.upsert_consultation(consultation),
        }
    }

    pub fn consultation_by_id(&self, id: &str) -> Result<Option<ConsultationRecord>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.consultations.get(id).cloned()),
            StoreBackend::Sqlite(store) => store.consultation_by_id(id),
        }
    }

    /// Consultations this customer created since `since` that still count
    /// toward quota (everything except CANCELLED).
    pub fn count_monthly_active(
        &self,
        customer_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .consultations
                .values()
                .filter(|c| {
                    c.customer_id == customer_id
                        && c.status != ConsultationStatus::Cancelled
                        && c.created_at >= since
                })
                .count() as i64),
            StoreBackend::Sqlite(store) => store.count_monthly_active(customer_id, since),
        }
    }

    /// Compare-and-swap status update: the patch lands only if the record
    /// still has the transition's expected status.
    pub fn apply_transition(
        &mut self,
        id: &str,
        transition: &Transition,
    ) -> Result<TransitionOutcome, String> {
        match self {
            StoreBackend::Memory(store) => {
                let Some(record) = store.consultations.get_mut(id) else {
                    return Ok(TransitionOutcome::NotFound);
                };
                if record.status != transition.expect {
                    return Ok(TransitionOutcome::Conflict(record.status));
                }
                apply_patch(record, transition);
                Ok(TransitionOutcome::Applied(record.clone()))
            }
            StoreBackend::Sqlite(store) => store.apply_transition(id, transition),
        }
    }

    pub fn touch_last_activity(&mut self, id: &str, now: DateTime<Utc>) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                if let Some(record) = store.consultations.get_mut(id) {
                    record.last_activity_at = Some(now);
                }
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.touch_last_activity(id, now),
        }
    }

    /// Scoped consultation listing, newest first, plus the unpaginated total.
    pub fn list_consultations(
        &self,
        filter: &ConsultationFilter,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<ConsultationRecord>, i64), String> {
        let mut matching: Vec<ConsultationRecord> = match self {
            StoreBackend::Memory(store) => store
                .consultations
                .values()
                .filter(|c| filter_matches(filter, c))
                .cloned()
                .collect(),
            StoreBackend::Sqlite(store) => store.list_consultations(filter)?,
        };
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        let total = matching.len() as i64;
        Ok((page_slice(&matching, page, limit), total))
    }

    pub fn all_consultations(&self) -> Result<Vec<ConsultationRecord>, String> {
        self.list_consultations(
            &ConsultationFilter {
                scope: ListScope::All,
                status: None,
            },
            1,
            i64::MAX,
        )
        .map(|(items, _)| items)
    }

    pub fn insert_message(&mut self, message: &MessageRecord) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .messages
                    .entry(message.consultation_id.clone())
                    .or_default()
                    .push(message.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.insert_message(message),
        }
    }

    /// Message history, ascending by creation.
    pub fn list_messages(&self, consultation_id: &str) -> Result<Vec<MessageRecord>, String> {
        let mut messages = match self {
            StoreBackend::Memory(store) => store
                .messages
                .get(consultation_id)
                .cloned()
                .unwrap_or_default(),
            StoreBackend::Sqlite(store) => store.list_messages(consultation_id)?,
        };
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(messages)
    }
}

impl SqliteStore {
    /// Indexed columns carry what queries filter on; the full record lives
    /// in `record_json` so the wire shape has one source of truth.
    pub fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                token TEXT NOT NULL,
                role TEXT NOT NULL,
                status TEXT NOT NULL,
                plan TEXT,
                record_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS consultations (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                lawyer_id TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                record_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                consultation_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                record_json TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn upsert_user(&mut self, user: &UserRecord) -> Result<(), String> {
        let json = serde_json::to_string(user).map_err(|e| e.to_string())?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO users(id, email, token, role, status, plan, record_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    user.id,
                    user.email,
                    user.token,
                    user.role.as_str(),
                    user.status.as_str(),
                    user.plan.map(|p| p.as_str()),
                    json
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn user_by(&self, column: &str, value: &str) -> Result<Option<UserRecord>, String> {
        // `column` is a compile-time constant at every call site.
        let sql = format!("SELECT record_json, token FROM users WHERE {column} = ?1");
        let row: Option<(String, String)> = self
            .conn
            .query_row(&sql, params![value], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()
            .map_err(|e| e.to_string())?;
        row.map(|(json, token)| decode_user(&json, token)).transpose()
    }

    fn list_users(&self, filter: &UserFilter) -> Result<Vec<UserRecord>, String> {
        let mut conditions: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(role) = filter.role {
            conditions.push("role = ?".to_string());
            args.push(role.as_str().to_string());
        }
        if let Some(status) = filter.status {
            conditions.push("status = ?".to_string());
            args.push(status.as_str().to_string());
        }
        if let Some(plan) = filter.plan {
            conditions.push("plan = ?".to_string());
            args.push(plan.as_str().to_string());
        }
        let where_clause = if conditions.is_empty() {
            "1=1".to_string()
        } else {
            conditions.join(" AND ")
        };
        let sql = format!("SELECT record_json, token FROM users WHERE {where_clause}");
        let mut stmt = self.conn.prepare(&sql).map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| e.to_string())?;
        let mut users = Vec::new();
        for row in rows {
            let (json, token) = row.map_err(|e| e.to_string())?;
            users.push(decode_user(&json, token)?);
        }
        Ok(users)
    }

    fn upsert_consultation(&mut self, consultation: &ConsultationRecord) -> Result<(), String> {
        let json = serde_json::to_string(consultation).map_err(|e| e.to_string())?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO consultations
                 (id, customer_id, lawyer_id, status, created_at, record_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    consultation.id,
                    consultation.customer_id,
                    consultation.lawyer_id,
                    consultation.status.as_str(),
                    consultation.created_at.to_rfc3339(),
                    json
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn consultation_by_id(&self, id: &str) -> Result<Option<ConsultationRecord>, String> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT record_json FROM consultations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        json.map(|v| decode_consultation(&v)).transpose()
    }

    fn count_monthly_active(
        &self,
        customer_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, String> {
        // RFC3339 UTC timestamps compare correctly as text.
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM consultations
                 WHERE customer_id = ?1 AND status != 'CANCELLED' AND created_at >= ?2",
                params![customer_id, since.to_rfc3339()],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())?;
        Ok(count)
    }

    fn apply_transition(
        &mut self,
        id: &str,
        transition: &Transition,
    ) -> Result<TransitionOutcome, String> {
        let Some(current) = self.consultation_by_id(id)? else {
            return Ok(TransitionOutcome::NotFound);
        };
        if current.status != transition.expect {
            return Ok(TransitionOutcome::Conflict(current.status));
        }
        let mut updated = current;
        apply_patch(&mut updated, transition);
        let json = serde_json::to_string(&updated).map_err(|e| e.to_string())?;
        let changed = self
            .conn
            .execute(
                "UPDATE consultations SET lawyer_id = ?1, status = ?2, record_json = ?3
                 WHERE id = ?4 AND status = ?5",
                params![
                    updated.lawyer_id,
                    updated.status.as_str(),
                    json,
                    id,
                    transition.expect.as_str()
                ],
            )
            .map_err(|e| e.to_string())?;
        if changed == 0 {
            return match self.consultation_by_id(id)? {
                Some(record) => Ok(TransitionOutcome::Conflict(record.status)),
                None => Ok(TransitionOutcome::NotFound),
            };
        }
        Ok(TransitionOutcome::Applied(updated))
    }

    fn touch_last_activity(&mut self, id: &str, now: DateTime<Utc>) -> Result<(), String> {
        let Some(mut record) = self.consultation_by_id(id)? else {
            return Ok(());
        };
        record.last_activity_at = Some(now);
        self.upsert_consultation(&record)
    }

    fn list_consultations(
        &self,
        filter: &ConsultationFilter,
    ) -> Result<Vec<ConsultationRecord>, String> {
        let mut args: Vec<String> = Vec::new();
        let scope_clause = match &filter.scope {
            ListScope::All => "1=1".to_string(),
            ListScope::ForCustomer(id) => {
                args.push(id.clone());
                "customer_id = ?1".to_string()
            }
            ListScope::RequestedPool => "status = 'REQUESTED'".to_string(),
            ListScope::AssignedTo(id) => {
                args.push(id.clone());
                "lawyer_id = ?1".to_string()
            }
            ListScope::PoolOrAssigned(id) => {
                args.push(id.clone());
                "(status = 'REQUESTED' OR lawyer_id = ?1)".to_string()
            }
        };
        let sql = match filter.status {
            Some(status) => {
                args.push(status.as_str().to_string());
                format!(
                    "SELECT record_json FROM consultations WHERE {scope_clause} AND status = ?{}",
                    args.len()
                )
            }
            None => format!("SELECT record_json FROM consultations WHERE {scope_clause}"),
        };
        let mut stmt = self.conn.prepare(&sql).map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| row.get::<_, String>(0))
            .map_err(|e| e.to_string())?;
        let mut consultations = Vec::new();
        for row in rows {
            consultations.push(decode_consultation(&row.map_err(|e| e.to_string())?)?);
        }
        Ok(consultations)
    }

    fn insert_message(&mut self, message: &MessageRecord) -> Result<(), String> {
        let json = serde_json::to_string(message).map_err(|e| e.to_string())?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO messages(id, consultation_id, created_at, record_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    message.id,
                    message.consultation_id,
                    message.created_at.to_rfc3339(),
                    json
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn list_messages(&self, consultation_id: &str) -> Result<Vec<MessageRecord>, String> {
        let mut stmt = self
            .conn
            .prepare("SELECT record_json FROM messages WHERE consultation_id = ?1")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![consultation_id], |row| row.get::<_, String>(0))
            .map_err(|e| e.to_string())?;
        let mut messages = Vec::new();
        for row in rows {
            let json: String = row.map_err(|e| e.to_string())?;
            messages.push(serde_json::from_str(&json).map_err(|e| e.to_string())?);
        }
        Ok(messages)
    }
}

/// The token never round-trips through `record_json` (it is excluded from
/// serialization), so it is restored from its own column here.
fn decode_user(json: &str, token: String) -> Result<UserRecord, String> {
    let mut user: UserRecord = serde_json::from_str(json).map_err(|e| e.to_string())?;
    user.token = token;
    Ok(user)
}

fn decode_consultation(json: &str) -> Result<ConsultationRecord, String> {
    serde_json::from_str(json).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexline_contracts::{PlanTier, Role, UserStatus};

    #[test]
    fn page_slice_tolerates_out_of_range_pages() {
        let items: Vec<i64> = (0..5).collect();
        assert_eq!(page_slice(&items, 1, 2), vec![0, 1]);
        assert_eq!(page_slice(&items, 3, 2), vec![4]);
        assert!(page_slice(&items, 4, 2).is_empty());
        assert!(page_slice(&items, i64::MAX, 100).is_empty());
    }

    fn temp_db() -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("lexline-store-{nanos}.db"))
            .to_string_lossy()
            .into_owned()
    }

    fn sample_user() -> UserRecord {
        UserRecord {
            id: "usr_store_test".to_string(),
            email: "cliente@example.com".to_string(),
            phone: None,
            role: Role::Customer,
            status: UserStatus::Active,
            plan: Some(PlanTier::Basic),
            plan_expires_at: None,
            trial_expires_at: None,
            is_on_trial: false,
            token: "tok-store-test".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn sqlite_read_failures_surface_as_errors() {
        let path = temp_db();
        let mut store = StoreBackend::Sqlite(SqliteStore::new(&path).unwrap());
        store.insert_user(&sample_user()).unwrap();
        assert!(store.user_by_token("tok-store-test").unwrap().is_some());
        assert!(store.user_by_id("usr_missing").unwrap().is_none());

        // Losing the table must come back as Err, never as "no such user".
        let StoreBackend::Sqlite(inner) = &store else {
            unreachable!();
        };
        inner.conn.execute_batch("DROP TABLE users;").unwrap();
        assert!(store.user_by_id("usr_store_test").is_err());
        assert!(store.user_by_token("tok-store-test").is_err());
        assert!(store.user_by_email("cliente@example.com").is_err());

        let _ = std::fs::remove_file(&path);
    }
}
