//! Ready-made subjects and condition sets for the common web-application case: authenticated
//! users, incoming requests, the host the process runs on, and the current date.
use std::net::IpAddr;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    condition_set::{ConditionSet, SubjectConditionSet, Verdict},
    field::{BeforeDate, Boolean, Field, Fields, IpAddress, OnOrAfterDate, Percent, Text},
    subject::Subject,
    switch::Conditions,
    Result, Value,
};

/// An application user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Primary key. `None` for anonymous users.
    pub id: Option<i64>,
    /// Login name.
    pub username: String,
    /// Contact address, possibly empty.
    pub email: String,
    /// Set for the user of an unauthenticated request.
    pub is_anonymous: bool,
    /// Whether the account may log in.
    pub is_active: bool,
    /// Whether the user may access administrative tools.
    pub is_staff: bool,
    /// Whether the user holds every permission.
    pub is_superuser: bool,
    /// When the account was created.
    pub date_joined: NaiveDateTime,
}

impl User {
    /// Subject kind of users.
    pub const KIND: &'static str = "auth.user";

    /// An active, non-staff user who joined just now.
    pub fn new(id: i64, username: impl Into<String>) -> User {
        User {
            id: Some(id),
            username: username.into(),
            email: String::new(),
            is_anonymous: false,
            is_active: true,
            is_staff: false,
            is_superuser: false,
            date_joined: Utc::now().naive_utc(),
        }
    }

    /// The user of an unauthenticated request.
    pub fn anonymous() -> User {
        User {
            id: None,
            username: String::new(),
            is_anonymous: true,
            is_active: false,
            ..User::new(0, "")
        }
    }
}

impl Subject for User {
    fn kind(&self) -> &str {
        User::KIND
    }

    fn attribute(&self, name: &str) -> Option<Value> {
        let value = match name {
            "id" => self.id.into(),
            "username" => self.username.as_str().into(),
            "email" => self.email.as_str().into(),
            "is_anonymous" => self.is_anonymous.into(),
            "is_active" => self.is_active.into(),
            "is_staff" => self.is_staff.into(),
            "is_superuser" => self.is_superuser.into(),
            "date_joined" => self.date_joined.into(),
            _ => return None,
        };
        Some(value)
    }

    fn identity(&self) -> Value {
        self.id.into()
    }
}

/// An incoming request, carrying its client address and authenticated user.
///
/// Evaluating a switch for a request also evaluates it for the request's user.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Address of the peer that sent the request.
    pub remote_addr: String,
    /// Client address as resolved by proxies in front of the application, if any.
    pub ip: Option<String>,
    /// Authenticated user, if any.
    pub user: Option<User>,
}

impl Request {
    /// Subject kind of requests.
    pub const KIND: &'static str = "request";

    /// A request from `remote_addr` with no proxy-resolved address and no user.
    pub fn new(remote_addr: impl Into<String>) -> Request {
        Request {
            remote_addr: remote_addr.into(),
            ip: None,
            user: None,
        }
    }

    /// Set the proxy-resolved client address.
    pub fn with_ip(mut self, ip: impl Into<String>) -> Request {
        self.ip = Some(ip.into());
        self
    }

    /// Attach the authenticated user.
    pub fn with_user(mut self, user: User) -> Request {
        self.user = Some(user);
        self
    }
}

impl Subject for Request {
    fn kind(&self) -> &str {
        Request::KIND
    }

    fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "remote_addr" => Some(self.remote_addr.as_str().into()),
            "ip" => Some(self.ip.as_deref().unwrap_or(&self.remote_addr).into()),
            _ => None,
        }
    }

    fn embedded_subjects(&self) -> Vec<&dyn Subject> {
        self.user
            .iter()
            .map(|user| user as &dyn Subject)
            .collect()
    }
}

/// User attributes: bucketing on the primary key, identity, and permission flags.
///
/// Anonymous users only answer the `is_anonymous` rule: any condition stored for it makes them
/// active, every other rule is ignored.
#[derive(Debug, Clone)]
pub struct UserConditionSet {
    users: SubjectConditionSet,
}

impl UserConditionSet {
    /// Create the condition set with its standard user fields.
    pub fn new() -> UserConditionSet {
        UserConditionSet {
            users: SubjectConditionSet::new(User::KIND)
                .with_field(Field::new("username", Text))
                .with_field(Field::new("email", Text))
                .with_field(Field::new("is_anonymous", Boolean).with_label("Anonymous"))
                .with_field(Field::new("is_active", Boolean).with_label("Active"))
                .with_field(Field::new("is_staff", Boolean).with_label("Staff"))
                .with_field(Field::new("is_superuser", Boolean).with_label("Superuser"))
                .with_field(
                    Field::new("date_joined", OnOrAfterDate).with_label("Joined on or after"),
                ),
        }
    }
}

impl Default for UserConditionSet {
    fn default() -> Self {
        UserConditionSet::new()
    }
}

impl ConditionSet for UserConditionSet {
    fn id(&self) -> String {
        format!("switchyard::builtins::UserConditionSet({})", User::KIND)
    }

    fn namespace(&self) -> String {
        self.users.namespace()
    }

    fn fields(&self) -> &Fields {
        self.users.fields()
    }

    fn group_label(&self) -> String {
        self.users.group_label()
    }

    fn can_execute(&self, subject: Option<&dyn Subject>) -> bool {
        self.users.can_execute(subject)
    }

    fn is_active(&self, subject: Option<&dyn Subject>, conditions: &Conditions) -> Result<Verdict> {
        let anonymous = subject
            .and_then(|subject| subject.attribute("is_anonymous"))
            .is_some_and(|value| value.is_truthy());
        if !anonymous {
            return self.users.is_active(subject, conditions);
        }

        let has_rule = conditions
            .get(&self.namespace())
            .and_then(|by_field| by_field.get("is_anonymous"))
            .is_some_and(|field_conditions| !field_conditions.is_empty());
        Ok(if has_rule {
            Verdict::Active
        } else {
            Verdict::Indifferent
        })
    }
}

/// Client address rules for [`Request`] subjects.
#[derive(Debug, Clone)]
pub struct IpAddressConditionSet {
    fields: Fields,
    internal_ips: Vec<String>,
}

impl IpAddressConditionSet {
    /// Create the condition set with no internal addresses.
    pub fn new() -> IpAddressConditionSet {
        IpAddressConditionSet {
            fields: Fields::new()
                .with(Field::new("percent", Percent))
                .with(Field::new("ip_address", IpAddress).with_label("IP Address"))
                .with(Field::new("internal_ip", Boolean).with_label("Internal IPs")),
            internal_ips: Vec::new(),
        }
    }

    /// Addresses the `internal_ip` rule treats as internal.
    pub fn with_internal_ips<I, S>(mut self, internal_ips: I) -> IpAddressConditionSet
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.internal_ips = internal_ips.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for IpAddressConditionSet {
    fn default() -> Self {
        IpAddressConditionSet::new()
    }
}

/// Fold an address into a percent bucket source: IPv4 addresses become the sum of their octets,
/// IPv6 addresses their 128-bit value (reduced to the same bucket).
fn ip_to_bucket(addr: &str) -> Value {
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => Value::Integer(ip.octets().iter().map(|&o| i64::from(o)).sum()),
        Ok(IpAddr::V6(ip)) => Value::Integer((u128::from(ip) % 100) as i64),
        Err(_) => Value::Null,
    }
}

impl ConditionSet for IpAddressConditionSet {
    fn id(&self) -> String {
        "switchyard::builtins::IpAddressConditionSet".to_owned()
    }

    fn namespace(&self) -> String {
        "ip".to_owned()
    }

    fn fields(&self) -> &Fields {
        &self.fields
    }

    fn group_label(&self) -> String {
        "IP Address".to_owned()
    }

    fn can_execute(&self, subject: Option<&dyn Subject>) -> bool {
        subject.is_some_and(|subject| subject.kind() == Request::KIND)
    }

    fn field_value(&self, subject: Option<&dyn Subject>, field: &Field) -> Value {
        let Some(subject) = subject else {
            return Value::Null;
        };
        let remote_addr = subject.attribute("remote_addr").unwrap_or(Value::Null);
        match field.name() {
            "percent" => remote_addr.as_str().map_or(Value::Null, ip_to_bucket),
            "ip_address" => subject.attribute("ip").unwrap_or(Value::Null),
            "internal_ip" => remote_addr
                .as_str()
                .is_some_and(|addr| self.internal_ips.iter().any(|ip| ip == addr))
                .into(),
            name => subject.attribute(name).unwrap_or(Value::Null),
        }
    }
}

/// Rules on the name of the host evaluating the switch. Subject-independent.
#[derive(Debug, Clone)]
pub struct HostConditionSet {
    fields: Fields,
    hostname: String,
}

impl HostConditionSet {
    /// Match against an explicit host name.
    pub fn new(hostname: impl Into<String>) -> HostConditionSet {
        HostConditionSet {
            fields: Fields::new().with(Field::new("hostname", Text)),
            hostname: hostname.into(),
        }
    }

    /// Read the host name from `$HOSTNAME`, falling back to `/etc/hostname`.
    pub fn from_env() -> Result<HostConditionSet> {
        let hostname = match std::env::var("HOSTNAME") {
            Ok(hostname) if !hostname.is_empty() => hostname,
            _ => std::fs::read_to_string("/etc/hostname")?.trim().to_owned(),
        };
        Ok(HostConditionSet::new(hostname))
    }

    /// The host name conditions are compared with.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

impl ConditionSet for HostConditionSet {
    fn id(&self) -> String {
        "switchyard::builtins::HostConditionSet".to_owned()
    }

    fn namespace(&self) -> String {
        "host".to_owned()
    }

    fn fields(&self) -> &Fields {
        &self.fields
    }

    fn group_label(&self) -> String {
        "Host".to_owned()
    }

    fn can_execute(&self, subject: Option<&dyn Subject>) -> bool {
        subject.is_none()
    }

    fn field_value(&self, _subject: Option<&dyn Subject>, field: &Field) -> Value {
        match field.name() {
            "hostname" => self.hostname.as_str().into(),
            _ => Value::Null,
        }
    }
}

/// Source of the current time for the date condition sets.
pub type Clock = fn() -> DateTime<Utc>;

fn today_fields(zone: &str) -> Fields {
    Fields::new()
        .with(
            Field::new("today_is_on_or_after", OnOrAfterDate)
                .with_label(format!("in {zone} on or after")),
        )
        .with(Field::new("today_is_before", BeforeDate).with_label(format!("in {zone} before")))
}

/// Rules on the current date in UTC. Subject-independent.
#[derive(Debug, Clone)]
pub struct UtcTodayConditionSet {
    fields: Fields,
    now: Clock,
}

impl UtcTodayConditionSet {
    /// Read the current date from the system clock.
    pub fn new() -> UtcTodayConditionSet {
        UtcTodayConditionSet {
            fields: today_fields("UTC"),
            now: Utc::now,
        }
    }

    /// Replace the clock, e.g. to pin the date in tests.
    pub fn with_clock(mut self, now: Clock) -> UtcTodayConditionSet {
        self.now = now;
        self
    }
}

impl Default for UtcTodayConditionSet {
    fn default() -> Self {
        UtcTodayConditionSet::new()
    }
}

impl ConditionSet for UtcTodayConditionSet {
    fn id(&self) -> String {
        "switchyard::builtins::UtcTodayConditionSet".to_owned()
    }

    fn namespace(&self) -> String {
        "now_utc".to_owned()
    }

    fn fields(&self) -> &Fields {
        &self.fields
    }

    fn group_label(&self) -> String {
        "Today".to_owned()
    }

    fn can_execute(&self, subject: Option<&dyn Subject>) -> bool {
        subject.is_none()
    }

    fn field_value(&self, _subject: Option<&dyn Subject>, _field: &Field) -> Value {
        (self.now)().into()
    }
}

/// Rules on the current date in the application's time zone. Subject-independent.
#[derive(Debug, Clone)]
pub struct AppTodayConditionSet {
    fields: Fields,
    offset: FixedOffset,
    now: Clock,
}

impl AppTodayConditionSet {
    /// Compute today's date at `offset` from UTC.
    pub fn new(offset: FixedOffset) -> AppTodayConditionSet {
        AppTodayConditionSet {
            fields: today_fields("default timezone"),
            offset,
            now: Utc::now,
        }
    }

    /// Replace the clock, e.g. to pin the date in tests.
    pub fn with_clock(mut self, now: Clock) -> AppTodayConditionSet {
        self.now = now;
        self
    }
}

impl ConditionSet for AppTodayConditionSet {
    fn id(&self) -> String {
        "switchyard::builtins::AppTodayConditionSet".to_owned()
    }

    fn namespace(&self) -> String {
        "now_app_tz".to_owned()
    }

    fn fields(&self) -> &Fields {
        &self.fields
    }

    fn group_label(&self) -> String {
        "Today".to_owned()
    }

    fn can_execute(&self, subject: Option<&dyn Subject>) -> bool {
        subject.is_none()
    }

    fn field_value(&self, _subject: Option<&dyn Subject>, _field: &Field) -> Value {
        (self.now)().with_timezone(&self.offset).into()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};

    use super::*;
    use crate::{ManagerConfig, SwitchManager, SwitchStatus};

    const USERS: &str = "switchyard::builtins::UserConditionSet(auth.user)";
    const IPS: &str = "switchyard::builtins::IpAddressConditionSet";

    fn manager() -> SwitchManager {
        let _ = env_logger::builder().is_test(true).try_init();

        let manager = ManagerConfig::in_memory().to_manager();
        manager.register(UserConditionSet::new());
        manager.register(IpAddressConditionSet::new().with_internal_ips(["127.0.0.1"]));
        manager
    }

    fn selective(manager: &SwitchManager, key: &str) {
        manager.set_status(key, SwitchStatus::Selective).unwrap();
    }

    #[test]
    fn user_percent_then_staff() {
        let manager = manager();
        selective(&manager, "test");
        manager
            .add_condition("test", USERS, "percent", "0-50", false)
            .unwrap();

        assert!(manager.is_active("test", &[&User::new(5, "foo")]));
        let mut user = User::new(8771, "bar");
        assert!(!manager.is_active("test", &[&user]));

        manager
            .add_condition("test", USERS, "is_staff", "1", false)
            .unwrap();
        user.is_staff = true;
        assert!(manager.is_active("test", &[&user]));
    }

    #[test]
    fn anonymous_only_answers_is_anonymous() {
        let manager = manager();
        selective(&manager, "test");
        manager
            .add_condition("test", USERS, "percent", "0-100", false)
            .unwrap();

        assert!(!manager.is_active("test", &[&User::anonymous()]));
        assert!(manager.is_active("test", &[&User::new(1, "foo")]));

        manager
            .add_condition("test", USERS, "is_anonymous", "1", false)
            .unwrap();
        assert!(manager.is_active("test", &[&User::anonymous()]));
    }

    #[test]
    fn date_joined() {
        let manager = manager();
        selective(&manager, "test");
        manager
            .add_condition("test", USERS, "date_joined", "2016-08-05", false)
            .unwrap();

        let joined = |d| User {
            date_joined: NaiveDate::from_ymd_opt(2016, 8, d)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
            ..User::new(1, "foo")
        };
        assert!(manager.is_active("test", &[&joined(5)]));
        assert!(manager.is_active("test", &[&joined(10)]));
        assert!(!manager.is_active("test", &[&joined(2)]));
    }

    #[test]
    fn request_expands_to_user() {
        let manager = manager();
        selective(&manager, "test");
        manager
            .add_condition("test", USERS, "username", "foo", false)
            .unwrap();

        let request = Request::new("10.0.0.1").with_user(User::new(1, "foo"));
        assert!(manager.is_active("test", &[&request]));
        assert!(!manager.is_active("test", &[&Request::new("10.0.0.1")]));
    }

    #[test]
    fn ip_address_percent() {
        let manager = manager();
        selective(&manager, "test");
        manager
            .add_condition("test", IPS, "percent", "0-50", false)
            .unwrap();

        // octets sum to 1 and to 4*200 = 800 (bucket 0)
        assert!(manager.is_active("test", &[&Request::new("1.0.0.0")]));
        assert!(manager.is_active("test", &[&Request::new("200.200.200.200")]));
        // 192+168+1+1 = 362 (bucket 62)
        assert!(!manager.is_active("test", &[&Request::new("192.168.1.1")]));
        assert!(!manager.is_active("test", &[&Request::new("garbage")]));
    }

    #[test]
    fn ip_address_and_internal_ip() {
        let manager = manager();
        selective(&manager, "test");
        manager
            .add_condition("test", IPS, "ip_address", "192.168.1.1", false)
            .unwrap();
        assert!(manager
            .add_condition("test", IPS, "ip_address", "not an ip", false)
            .is_err());

        assert!(manager.is_active("test", &[&Request::new("192.168.1.1")]));
        assert!(manager.is_active("test", &[&Request::new("10.0.0.1").with_ip("192.168.1.1")]));
        assert!(!manager.is_active("test", &[&Request::new("192.168.1.2")]));

        selective(&manager, "internal");
        manager
            .add_condition("internal", IPS, "internal_ip", "1", false)
            .unwrap();
        assert!(manager.is_active("internal", &[&Request::new("127.0.0.1")]));
        assert!(!manager.is_active("internal", &[&Request::new("10.0.0.1")]));
    }

    #[test]
    fn ipv6_percent_bucket() {
        // ::64 is 100, bucket 0
        assert_eq!(ip_to_bucket("::64"), Value::Integer(0));
        assert_eq!(ip_to_bucket("::65"), Value::Integer(1));
        assert_eq!(ip_to_bucket("10.0.0.1"), Value::Integer(11));
    }

    #[test]
    fn hostname() {
        let manager = manager();
        manager.register(HostConditionSet::new("web-1"));
        selective(&manager, "test");
        let id = "switchyard::builtins::HostConditionSet";
        manager
            .add_condition("test", id, "hostname", "web-1", false)
            .unwrap();
        assert!(manager.is_active("test", &[]));

        manager.register(HostConditionSet::new("web-2"));
        assert!(!manager.is_active("test", &[]));
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 8, 5, 0, 30, 0).unwrap()
    }

    #[test]
    fn utc_today() {
        let manager = manager();
        manager.register(UtcTodayConditionSet::new().with_clock(fixed_now));
        let id = "switchyard::builtins::UtcTodayConditionSet";

        selective(&manager, "after");
        manager
            .add_condition("after", id, "today_is_on_or_after", "2016-08-05", false)
            .unwrap();
        assert!(manager.is_active("after", &[]));

        selective(&manager, "before");
        manager
            .add_condition("before", id, "today_is_before", "2016-08-05", false)
            .unwrap();
        assert!(!manager.is_active("before", &[]));
    }

    #[test]
    fn app_today_uses_offset() {
        let manager = manager();
        let offset = FixedOffset::west_opt(3600).unwrap();
        manager.register(AppTodayConditionSet::new(offset).with_clock(fixed_now));
        let id = "switchyard::builtins::AppTodayConditionSet";

        selective(&manager, "test");
        manager
            .add_condition("test", id, "today_is_before", "2016-08-05", false)
            .unwrap();
        // still August 4th one hour west of UTC
        assert!(manager.is_active("test", &[]));
    }

    #[test]
    fn group_labels() {
        let manager = manager();
        manager.register(UtcTodayConditionSet::new());
        let labels = manager
            .condition_sets()
            .iter()
            .map(|c| c.group_label())
            .collect::<Vec<_>>();
        assert_eq!(labels, ["IP Address", "Today", "User"]);
    }
}
