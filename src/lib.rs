//! Hierarchical feature switches with pluggable, condition-based targeting.
//!
//! # Overview
//!
//! A [`Switch`] is a persisted flag identified by a key such as `"checkout"` or
//! `"checkout:new_flow"`. Colons form a hierarchy: a disabled ancestor turns off every descendant,
//! and an active ancestor supplies the fallback for descendants that defer to it.
//!
//! Each switch has a [`SwitchStatus`]. `Global` and `Disabled` switches are on or off for
//! everyone. `Inherit` switches take their ancestor's result. `Selective` switches are active
//! only for subjects matching their stored conditions.
//!
//! Conditions are expressed against condition sets: pluggable rule groups bound to a kind of
//! subject ("users", "requests", "the current date"). Each condition set declares typed fields
//! (percent buckets, ranges, booleans, dates, strings) and is registered with a [`Registry`].
//! Callers adapt their own types through the [`Subject`] trait, or use [`Entity`] and the types in
//! [`builtins`].
//!
//! A [`SwitchManager`] ties it together: it evaluates switches for subjects and applies
//! administrative changes through a caching [`SwitchStore`] over a pluggable
//! [`Backend`](backend::Backend).
//!
//! ```
//! # use switchyard::{ManagerConfig, SwitchStatus, builtins::{User, UserConditionSet}};
//! let manager = ManagerConfig::in_memory().to_manager();
//! manager.register(UserConditionSet::new());
//!
//! manager.set_status("checkout", SwitchStatus::Selective)?;
//! manager.add_condition(
//!     "checkout",
//!     "switchyard::builtins::UserConditionSet(auth.user)",
//!     "is_staff",
//!     "1",
//!     false,
//! )?;
//!
//! let mut user = User::new(8771, "alice");
//! assert!(!manager.is_active("checkout", &[&user]));
//! user.is_staff = true;
//! assert!(manager.is_active("checkout", &[&user]));
//! # Ok::<(), switchyard::Error>(())
//! ```
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Evaluation through [`SwitchManager::is_active`] never fails: storage errors and contract
//! violations (e.g. a date field given a non-date value) are logged and the caller's default is
//! returned. Use [`SwitchManager::try_is_active`] to observe them. Administrative mutations return
//! validation and lookup errors to the caller.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with the `switchyard`
//! target. Consider integrating a `log`-compatible logger implementation for better visibility
//! into cache and evaluation behavior.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backend;
pub mod builtins;
pub mod condition_set;
mod config;
mod error;
pub mod field;
mod manager;
mod overrides;
mod refresher;
mod registry;
mod store;
mod subject;
mod switch;
mod value;

pub use config::{ManagerConfig, RefreshPolicy, SwitchDefault, SwitchDefaults};
pub use error::{Error, Result, ValidationError};
pub use manager::SwitchManager;
pub use overrides::OverrideGuard;
pub use refresher::{RefresherThread, RefresherThreadConfig};
pub use registry::{ConditionDescriptor, Registry};
pub use store::{SwitchChange, SwitchListener, SwitchStore};
pub use subject::{Entity, Subject};
pub use switch::{ActiveCondition, Conditions, StoredCondition, Switch, SwitchStatus};
pub use value::Value;
