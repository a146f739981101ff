use serde::{Deserialize, Serialize};

// --- Enums ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Active,
    Resumed,
    Expired,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Active => "active",
            TransferStatus::Resumed => "resumed",
            TransferStatus::Expired => "expired",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TransferStatus::Active),
            "resumed" => Some(TransferStatus::Resumed),
            "expired" => Some(TransferStatus::Expired),
            _ => None,
        }
    }

    pub fn valid_transitions(&self) -> Vec<TransferStatus> {
        match self {
            TransferStatus::Active => vec![TransferStatus::Resumed, TransferStatus::Expired],
            TransferStatus::Resumed => vec![],
            TransferStatus::Expired => vec![],
        }
    }

    pub fn can_transition_to(&self, target: &TransferStatus) -> bool {
        self.valid_transitions().contains(target)
    }

    pub fn is_terminal(&self) -> bool {
        self.valid_transitions().is_empty()
    }
}

/// Where a transfer came from. Informational only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferSource {
    #[default]
    Manual,
    Flow,
    Keyword,
}

impl TransferSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferSource::Manual => "manual",
            TransferSource::Flow => "flow",
            TransferSource::Keyword => "keyword",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(TransferSource::Manual),
            "flow" => Some(TransferSource::Flow),
            "keyword" => Some(TransferSource::Keyword),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    #[default]
    RoundRobin,
    LoadBalanced,
    Manual,
}

impl AssignmentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStrategy::RoundRobin => "round_robin",
            AssignmentStrategy::LoadBalanced => "load_balanced",
            AssignmentStrategy::Manual => "manual",
        }
    }

    /// Unknown or empty strategy names fall back to round robin.
    pub fn parse_or_default(s: &str) -> Self {
        match s {
            "load_balanced" => AssignmentStrategy::LoadBalanced,
            "manual" => AssignmentStrategy::Manual,
            _ => AssignmentStrategy::RoundRobin,
        }
    }
}

/// Role of a user inside one team.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Manager,
    Agent,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Manager => "manager",
            MemberRole::Agent => "agent",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "manager" => Some(MemberRole::Manager),
            "agent" => Some(MemberRole::Agent),
            _ => None,
        }
    }
}

/// Organization-wide role of a user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Manager,
    Agent,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Manager => "manager",
            UserRole::Agent => "agent",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(UserRole::Admin),
            "manager" => Some(UserRole::Manager),
            "agent" => Some(UserRole::Agent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "cancelled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }
}

// --- Domain models ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: String,
    pub organization_id: String,
    pub contact_id: String,
    pub channel_account_id: String,
    pub team_id: Option<String>,
    pub agent_id: Option<String>,
    /// User who initiated the transfer, or who picked it from the queue
    pub transferred_by: Option<String>,
    pub status: TransferStatus,
    pub source: TransferSource,
    pub notes: Option<String>,
    pub sla: SlaState,
    pub status_history: Vec<StatusHistoryEntry>,
    /// Queue FIFO key
    pub transferred_at: String,
    pub resumed_at: Option<String>,
    pub resumed_by: Option<String>,
    pub updated_at: String,
}

impl Transfer {
    pub fn is_active(&self) -> bool {
        self.status == TransferStatus::Active
    }

    pub fn is_queued(&self) -> bool {
        self.is_active() && self.agent_id.is_none()
    }
}

/// SLA bookkeeping for one transfer. Deadlines are only set when SLA is
/// enabled for the organization at creation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SlaState {
    pub response_deadline: Option<String>,
    pub resolution_deadline: Option<String>,
    pub escalation_deadline: Option<String>,
    pub expires_at: Option<String>,
    pub breached: bool,
    pub breached_at: Option<String>,
    /// 0, 1 or 2
    pub escalation_level: i64,
    pub picked_up_at: Option<String>,
    pub first_response_at: Option<String>,
}

pub const MAX_ESCALATION_LEVEL: i64 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: String,
    pub actor_id: Option<String>,
    pub actor_type: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub settings: OrgSettings,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub role: UserRole,
    pub is_active: bool,
    pub is_available: bool,
}

impl User {
    /// Whether the user can currently receive conversations.
    pub fn can_take_conversations(&self) -> bool {
        self.is_active && self.is_available
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub assignment_strategy: AssignmentStrategy,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    pub team_id: String,
    pub user_id: String,
    pub role: MemberRole,
    /// Round-robin cursor
    pub last_assigned_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub organization_id: String,
    pub name: Option<String>,
    pub phone: String,
    pub assigned_user_id: Option<String>,
    /// Channel account the automated layer last spoke through
    pub channel_account_id: Option<String>,
    /// Last message sent by the automated layer; drives inactivity tracking
    pub chatbot_last_message_at: Option<String>,
    pub chatbot_reminder_sent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatbotSession {
    pub id: String,
    pub organization_id: String,
    pub contact_id: String,
    pub status: SessionStatus,
    pub started_at: String,
    pub ended_at: Option<String>,
}

// --- Organization settings ---

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrgSettings {
    /// Route returning contacts back to the agent who last handled them
    pub assign_to_same_agent: bool,
    pub sla: SlaSettings,
    pub client_inactivity: ClientInactivitySettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SlaSettings {
    pub enabled: bool,
    pub response_minutes: Option<i64>,
    pub resolution_minutes: Option<i64>,
    pub escalation_minutes: Option<i64>,
    pub auto_close_hours: Option<i64>,
    pub auto_close_message: Option<String>,
    /// Sent to the customer on the first escalation
    pub warning_message: Option<String>,
    /// User ids listed in escalation broadcasts
    pub escalation_notify_ids: Vec<String>,
}

impl SlaSettings {
    pub fn response_window(&self) -> Option<i64> {
        positive(self.response_minutes)
    }

    pub fn resolution_window(&self) -> Option<i64> {
        positive(self.resolution_minutes)
    }

    pub fn escalation_window(&self) -> Option<i64> {
        positive(self.escalation_minutes)
    }

    pub fn auto_close_window_hours(&self) -> Option<i64> {
        positive(self.auto_close_hours)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientInactivitySettings {
    pub enabled: bool,
    pub reminder_minutes: Option<i64>,
    pub reminder_message: Option<String>,
    pub auto_close_minutes: Option<i64>,
    pub auto_close_message: Option<String>,
}

impl ClientInactivitySettings {
    pub fn reminder_window(&self) -> Option<i64> {
        positive(self.reminder_minutes)
    }

    pub fn auto_close_window(&self) -> Option<i64> {
        positive(self.auto_close_minutes)
    }
}

/// Zero or negative durations mean "disabled".
fn positive(v: Option<i64>) -> Option<i64> {
    v.filter(|m| *m > 0)
}

impl OrgSettings {
    /// Whether the scheduler has any work to do for this organization.
    pub fn needs_scheduler(&self) -> bool {
        self.sla.enabled || self.client_inactivity.enabled
    }
}

// --- Identity (from auth) ---

#[derive(Debug, Clone)]
pub enum Identity {
    User {
        id: String,
        organization_id: String,
        role: UserRole,
    },
    /// Automated callers (chatbot flows, keyword triggers, the scheduler)
    System { organization_id: String },
}

impl Identity {
    pub fn organization_id(&self) -> &str {
        match self {
            Identity::User {
                organization_id, ..
            } => organization_id,
            Identity::System { organization_id } => organization_id,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::User { id, .. } => Some(id),
            Identity::System { .. } => None,
        }
    }

    pub fn author_type(&self) -> &'static str {
        match self {
            Identity::User { .. } => "user",
            Identity::System { .. } => "system",
        }
    }

    pub fn author_id(&self) -> &str {
        match self {
            Identity::User { id, .. } => id,
            Identity::System { .. } => "system",
        }
    }

    pub fn is_admin(&self) -> bool {
        match self {
            Identity::User { role, .. } => *role == UserRole::Admin,
            Identity::System { .. } => true,
        }
    }

    /// Admins and managers may assign conversations to other agents.
    pub fn can_manage(&self) -> bool {
        match self {
            Identity::User { role, .. } => matches!(role, UserRole::Admin | UserRole::Manager),
            Identity::System { .. } => true,
        }
    }
}

// --- DTOs ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTransfer {
    pub contact_id: String,
    pub channel_account_id: String,
    pub agent_id: Option<String>,
    pub team_id: Option<String>,
    pub notes: Option<String>,
    pub source: Option<TransferSource>,
}

impl CreateTransfer {
    /// Builder used by tests and the chatbot integration.
    pub fn new(contact_id: impl Into<String>, channel_account_id: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
            channel_account_id: channel_account_id.into(),
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    pub fn with_source(mut self, source: TransferSource) -> Self {
        self.source = Some(source);
        self
    }
}

/// `agent_id = None` assigns the transfer to the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignTransfer {
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PickNextRequest {
    pub team_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickNextResponse {
    pub transfer: Option<Transfer>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueFilter {
    pub team_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectAgentResponse {
    pub team_id: String,
    pub agent_id: Option<String>,
}

// --- Directory inputs (seeding and tests) ---

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUser {
    pub name: String,
    pub role: UserRole,
    pub is_available: bool,
}

impl CreateUser {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: UserRole::Agent,
            is_available: true,
        }
    }

    pub fn with_role(mut self, role: UserRole) -> Self {
        self.role = role;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.is_available = false;
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTeam {
    pub name: String,
    pub assignment_strategy: String,
}

impl CreateTeam {
    pub fn new(name: impl Into<String>, strategy: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            assignment_strategy: strategy.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateContact {
    pub phone: String,
    pub name: Option<String>,
}

impl CreateContact {
    pub fn new(phone: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            name: None,
        }
    }
}
