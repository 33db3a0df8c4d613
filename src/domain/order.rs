use super::user::UserId;
use crate::error::{DispatchError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type OrderId = Uuid;
pub type SubOrderId = Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Taobao,
    Tmall,
    Jd,
    Douyin,
    Kuaishou,
}

impl std::str::FromStr for Platform {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "taobao" | "tb" => Ok(Platform::Taobao),
            "tmall" | "tm" => Ok(Platform::Tmall),
            "jd" => Ok(Platform::Jd),
            "douyin" | "dy" => Ok(Platform::Douyin),
            "kuaishou" | "ks" => Ok(Platform::Kuaishou),
            other => Err(DispatchError::Validation(format!(
                "Unknown platform: {other}"
            ))),
        }
    }
}

/// State of a master order.
///
/// ```text
/// Created ---> Cancel
///    |
///  Doing
///    |
///   / \
/// Done Finish
/// ```
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MasterState {
    /// Payable and editable; cancelled automatically when left unpaid.
    Created,
    /// Paid; workers may accept sub-orders.
    Doing,
    /// Deadline reached with every unit completed.
    Done,
    /// Deadline reached with units left uncompleted.
    Finish,
    Cancel,
}

impl MasterState {
    pub fn can_transition_to(self, next: MasterState) -> bool {
        use MasterState::*;
        matches!(
            (self, next),
            (Created, Doing) | (Created, Cancel) | (Doing, Done) | (Doing, Finish)
        )
    }
}

/// State of a sub-order.
///
/// ```text
///          Accept
///            |
///           / \
///  +---> Submit  Timeout
///  |        |
///  |       / \
///  +--- Reject  Complete
/// ```
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SubState {
    Accept,
    Submit,
    Timeout,
    Complete,
    Reject,
}

impl SubState {
    pub fn can_transition_to(self, next: SubState) -> bool {
        use SubState::*;
        matches!(
            (self, next),
            (Accept, Submit)
                | (Accept, Timeout)
                | (Submit, Submit)
                | (Submit, Complete)
                | (Submit, Reject)
                | (Reject, Submit)
                | (Reject, Timeout)
        )
    }

    /// Whether a sub-order in this state occupies one unit of its master
    /// order's capacity. Only a timed-out sub-order gives its unit back.
    pub fn holds_capacity(self) -> bool {
        self != SubState::Timeout
    }
}

macro_rules! display_as_serde_name {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}", self)
            }
        }
    )*};
}

display_as_serde_name!(MasterState, SubState, Platform);

/// The caller-editable part of a master order.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct OrderSpec {
    pub name: String,
    pub content: String,
    pub remark: String,
    pub platform: Platform,
    pub total: u32,
    pub deadline: DateTime<Utc>,
}

impl OrderSpec {
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DispatchError::Validation(
                "Order name is required".to_string(),
            ));
        }
        if self.total == 0 {
            return Err(DispatchError::Validation(
                "Order total must be at least one unit".to_string(),
            ));
        }
        if self.deadline <= now {
            return Err(DispatchError::Validation(
                "Order deadline must be in the future".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct MasterOrder {
    pub id: OrderId,
    pub owner: UserId,
    pub spec: OrderSpec,
    completed: u32,
    state: MasterState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MasterOrder {
    pub fn new(owner: UserId, spec: OrderSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            spec,
            completed: 0,
            state: MasterState::Created,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> MasterState {
        self.state
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }

    pub fn total(&self) -> u32 {
        self.spec.total
    }

    pub fn remaining(&self) -> u32 {
        self.spec.total - self.completed
    }

    pub fn is_filled(&self) -> bool {
        self.completed >= self.spec.total
    }

    pub(crate) fn transition(&mut self, next: MasterState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(DispatchError::StateConflict(format!(
                "Master order {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn replace_spec(&mut self, spec: OrderSpec, now: DateTime<Utc>) -> Result<()> {
        if self.state != MasterState::Created {
            return Err(DispatchError::StateConflict(format!(
                "Master order {} can only be modified while created, it is {}",
                self.id, self.state
            )));
        }
        self.spec = spec;
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn record_completion(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.is_filled() {
            return Err(DispatchError::StateConflict(format!(
                "Master order {} is already complete ({}/{})",
                self.id, self.completed, self.spec.total
            )));
        }
        self.completed += 1;
        self.updated_at = now;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct SubOrder {
    pub id: SubOrderId,
    pub master: OrderId,
    pub worker: UserId,
    state: SubState,
    /// Proof of work submitted by the worker (e.g. a screenshot reference).
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubOrder {
    pub fn new(master: OrderId, worker: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            master,
            worker,
            state: SubState::Accept,
            content: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> SubState {
        self.state
    }

    pub(crate) fn transition(&mut self, next: SubState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(DispatchError::StateConflict(format!(
                "Sub-order {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MasterOrderFilter {
    pub states: Vec<MasterState>,
    pub owner: Option<UserId>,
    pub platform: Option<Platform>,
}

impl MasterOrderFilter {
    pub fn in_state(state: MasterState) -> Self {
        Self {
            states: vec![state],
            ..Self::default()
        }
    }

    pub fn matches(&self, order: &MasterOrder) -> bool {
        (self.states.is_empty() || self.states.contains(&order.state))
            && self.owner.is_none_or(|owner| order.owner == owner)
            && self.platform.is_none_or(|platform| order.spec.platform == platform)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubOrderFilter {
    pub master: Option<OrderId>,
    pub worker: Option<UserId>,
    pub states: Vec<SubState>,
}

impl SubOrderFilter {
    pub fn of_master(master: OrderId) -> Self {
        Self {
            master: Some(master),
            ..Self::default()
        }
    }

    pub fn matches(&self, sub: &SubOrder) -> bool {
        self.master.is_none_or(|master| sub.master == master)
            && self.worker.is_none_or(|worker| sub.worker == worker)
            && (self.states.is_empty() || self.states.contains(&sub.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn spec(total: u32, now: DateTime<Utc>) -> OrderSpec {
        OrderSpec {
            name: "review".to_string(),
            content: "leave a review".to_string(),
            remark: String::new(),
            platform: Platform::Taobao,
            total,
            deadline: now + Duration::hours(1),
        }
    }

    #[test]
    fn test_master_state_machine() {
        use MasterState::*;
        assert!(Created.can_transition_to(Doing));
        assert!(Created.can_transition_to(Cancel));
        assert!(Doing.can_transition_to(Finish));
        assert!(Doing.can_transition_to(Done));
        assert!(!Doing.can_transition_to(Cancel));
        assert!(!Cancel.can_transition_to(Doing));
        assert!(!Finish.can_transition_to(Done));
    }

    #[test]
    fn test_sub_state_machine() {
        use SubState::*;
        assert!(Accept.can_transition_to(Submit));
        assert!(Reject.can_transition_to(Submit));
        assert!(Submit.can_transition_to(Submit));
        assert!(!Accept.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(Reject));
        assert!(!Timeout.can_transition_to(Submit));
        assert!(!Timeout.holds_capacity());
        assert!(Reject.holds_capacity());
    }

    #[test]
    fn test_spec_validation() {
        let now = Utc::now();
        assert!(spec(1, now).validate(now).is_ok());
        assert!(matches!(
            spec(0, now).validate(now),
            Err(DispatchError::Validation(_))
        ));
        let mut late = spec(1, now);
        late.deadline = now - Duration::seconds(1);
        assert!(late.validate(now).is_err());
        let mut unnamed = spec(1, now);
        unnamed.name = "  ".to_string();
        assert!(unnamed.validate(now).is_err());
    }

    #[test]
    fn test_completion_is_bounded_by_total() {
        let now = Utc::now();
        let mut order = MasterOrder::new(1, spec(1, now), now);
        order.record_completion(now).unwrap();
        assert_eq!(order.remaining(), 0);
        assert!(matches!(
            order.record_completion(now),
            Err(DispatchError::StateConflict(_))
        ));
        assert_eq!(order.completed(), 1);
    }

    #[test]
    fn test_modification_only_while_created() {
        let now = Utc::now();
        let mut order = MasterOrder::new(1, spec(2, now), now);
        order.replace_spec(spec(3, now), now).unwrap();
        assert_eq!(order.total(), 3);
        order.transition(MasterState::Doing, now).unwrap();
        assert!(order.replace_spec(spec(4, now), now).is_err());
        assert_eq!(order.total(), 3);
    }

    #[test]
    fn test_filters() {
        let now = Utc::now();
        let order = MasterOrder::new(9, spec(1, now), now);
        assert!(MasterOrderFilter::in_state(MasterState::Created).matches(&order));
        assert!(!MasterOrderFilter::in_state(MasterState::Doing).matches(&order));
        let by_owner = MasterOrderFilter {
            owner: Some(8),
            ..Default::default()
        };
        assert!(!by_owner.matches(&order));

        let sub = SubOrder::new(order.id, 3, now);
        assert!(SubOrderFilter::of_master(order.id).matches(&sub));
        let by_state = SubOrderFilter {
            states: vec![SubState::Submit],
            ..Default::default()
        };
        assert!(!by_state.matches(&sub));
    }
}
