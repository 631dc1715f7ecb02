//! The login/poll state machine.
//!
//! ```text
//!             login ok
//! UNAUTHENTICATED ─────────▶ POLLING ──┐ fetch ok, wait interval
//!   ▲    │ login failed,         │ ◀───┘
//!   │    └─ cooldown ─┘          │
//!   └──── fetch failed, cooldown ┘
//! ```
//!
//! Every login attempt gets a brand new session from the [`Connector`], so a
//! session that failed once is never used again.

use chrono::{DateTime, SecondsFormat, TimeZone};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::auth::login;
use crate::config::{Settings, MAX_INTERVAL};
use crate::delivery::fetch_delivery_date;
use crate::session::Connector;

/// Source of time for the monitor, so tests don't have to wait.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Receives delivery date changes.
pub trait Notifier {
    fn delivery_date_changed(&mut self, date: &str);
}

/// Prints one timestamped line per change to stdout.
pub struct StdoutNotifier;

impl Notifier for StdoutNotifier {
    fn delivery_date_changed(&mut self, date: &str) {
        println!("{}", change_line(&chrono::Local::now(), date));
    }
}

pub fn change_line<Tz: TimeZone>(at: &DateTime<Tz>, date: &str) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}: New Delivery Date! {}",
        at.to_rfc3339_opts(SecondsFormat::Secs, true),
        date
    )
}

/// Last delivery date seen during this process's lifetime.
#[derive(Debug, Default)]
pub struct DeliveryDateTracker {
    last: Option<String>,
}

impl DeliveryDateTracker {
    /// Record `date`, returning true when it differs from the previous one.
    pub fn observe(&mut self, date: &str) -> bool {
        if self.last.as_deref() == Some(date) {
            return false;
        }
        self.last = Some(date.to_string());
        true
    }
}

enum State<S> {
    Unauthenticated,
    Polling { session: S, next_tick: Instant },
}

/// What a single [`Monitor::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    LoginFailed,
    LoggedIn,
    FetchFailed,
    Unchanged(String),
    Changed(String),
}

pub struct Monitor<'a, C: Connector, K: Clock, N: Notifier> {
    settings: &'a Settings,
    connector: C,
    clock: K,
    notifier: N,
    state: State<C::Session>,
    tracker: DeliveryDateTracker,
}

impl<'a, C: Connector, K: Clock, N: Notifier> Monitor<'a, C, K, N> {
    pub fn new(settings: &'a Settings, connector: C, clock: K, notifier: N) -> Self {
        Self {
            settings,
            connector,
            clock,
            notifier,
            state: State::Unauthenticated,
            tracker: DeliveryDateTracker::default(),
        }
    }

    /// Run forever. Failures are logged and retried; nothing here exits.
    pub fn run(mut self) -> ! {
        loop {
            self.step();
        }
    }

    /// Perform one transition of the state machine.
    pub fn step(&mut self) -> Step {
        match std::mem::replace(&mut self.state, State::Unauthenticated) {
            State::Unauthenticated => self.authenticate(),
            State::Polling { session, next_tick } => self.poll(session, next_tick),
        }
    }

    fn authenticate(&mut self) -> Step {
        let session = self.connector.connect();
        let settings = self.settings;
        match login(&session, &settings.endpoints, &settings.credentials) {
            Ok(()) => {
                info!("logged in");
                self.state = State::Polling {
                    session,
                    next_tick: self.clock.now(),
                };
                Step::LoggedIn
            }
            Err(e) => {
                error!(error = %e, "login failed");
                self.clock.sleep(settings.cooldown);
                Step::LoginFailed
            }
        }
    }

    fn poll(&mut self, session: C::Session, next_tick: Instant) -> Step {
        let now = self.clock.now();
        if next_tick > now {
            self.clock.sleep(next_tick - now);
        }

        let settings = self.settings;
        let reservation = &settings.credentials.reservation;
        let date = match fetch_delivery_date(&session, &settings.endpoints, reservation) {
            Ok(date) => date,
            Err(e) => {
                // Unexpected content usually means the session expired.
                error!(error = %e, "delivery date lookup failed");
                self.clock.sleep(settings.cooldown);
                return Step::FetchFailed;
            }
        };

        // A late tick is not made up for; the next one is an interval out.
        let now = self.clock.now();
        let next_tick = match next_tick.checked_add(settings.interval) {
            Some(t) => t.max(now),
            None => {
                warn!(interval = ?settings.interval, "poll interval out of range, capping");
                now + MAX_INTERVAL
            }
        };
        self.state = State::Polling { session, next_tick };

        if self.tracker.observe(&date) {
            self.notifier.delivery_date_changed(&date);
            warn!(%date, "new delivery date");
            Step::Changed(date)
        } else {
            info!(%date, "delivery date unchanged");
            Step::Unchanged(date)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, Endpoints};
    use crate::session::{HttpError, HttpSession, Page};
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Clone)]
    struct FakeClock {
        now: Rc<Cell<Instant>>,
        sleeps: Rc<RefCell<Vec<Duration>>>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                now: Rc::new(Cell::new(Instant::now())),
                sleeps: Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn take_sleeps(&self) -> Vec<Duration> {
            self.sleeps.borrow_mut().drain(..).collect()
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            self.now.get()
        }

        fn sleep(&self, duration: Duration) {
            self.sleeps.borrow_mut().push(duration);
            self.now.set(self.now.get() + duration);
        }
    }

    #[derive(Default)]
    struct Recorder(Vec<String>);

    impl Notifier for Recorder {
        fn delivery_date_changed(&mut self, date: &str) {
            self.0.push(date.to_string());
        }
    }

    /// Scripted portal shared by every session the connector hands out.
    #[derive(Default)]
    struct Portal {
        logins: VecDeque<bool>,
        fetches: VecDeque<Option<&'static str>>,
        sessions: usize,
        requests: Vec<(usize, String)>,
    }

    struct FakeConnector(Rc<RefCell<Portal>>);

    struct FakeSession {
        id: usize,
        portal: Rc<RefCell<Portal>>,
    }

    impl Connector for FakeConnector {
        type Session = FakeSession;

        fn connect(&self) -> FakeSession {
            let mut portal = self.0.borrow_mut();
            portal.sessions += 1;
            FakeSession {
                id: portal.sessions,
                portal: self.0.clone(),
            }
        }
    }

    fn profile_body(date: &str) -> String {
        format!(
            r#"{{"copyOverride":"Estimated Delivery: {}","padding":"{}"}}"#,
            date,
            "-".repeat(100)
        )
    }

    impl HttpSession for FakeSession {
        fn get(&self, url: &str) -> Result<Page, HttpError> {
            let mut portal = self.portal.borrow_mut();
            portal.requests.push((self.id, url.to_string()));
            let body = if url.contains("/profile?") {
                match portal.fetches.pop_front().flatten() {
                    Some(date) => profile_body(date),
                    None => "<html>please sign in</html>".to_string(),
                }
            } else {
                r#"<form id="form"><input type="hidden" name="_csrf" value="t"></form>"#
                    .to_string()
            };
            Ok(Page {
                url: url.to_string(),
                body,
            })
        }

        fn post_form(&self, url: &str, _: &[(String, String)]) -> Result<Page, HttpError> {
            let mut portal = self.portal.borrow_mut();
            portal.requests.push((self.id, url.to_string()));
            let ok = portal.logins.pop_front().unwrap_or(true);
            Ok(Page {
                url: url.to_string(),
                body: if ok { "Sign Out" } else { "Sign In" }.to_string(),
            })
        }
    }

    fn settings() -> Settings {
        let creds = Credentials::parse(r#"{"Username": "u", "Password": "p", "Reservation": "RN7"}"#)
            .unwrap();
        Settings::new(creds, Endpoints::default(), Duration::from_secs(3600))
    }

    fn monitor<'a>(
        settings: &'a Settings,
        portal: &Rc<RefCell<Portal>>,
        clock: &FakeClock,
    ) -> Monitor<'a, FakeConnector, FakeClock, Recorder> {
        Monitor::new(
            settings,
            FakeConnector(portal.clone()),
            clock.clone(),
            Recorder::default(),
        )
    }

    #[test]
    fn test_tracker_observe() {
        let mut tracker = DeliveryDateTracker::default();
        assert!(tracker.observe("A"));
        assert!(!tracker.observe("A"));
        assert!(tracker.observe("B"));
        assert_eq!(tracker.last.as_deref(), Some("B"));
    }

    #[test]
    fn test_notifies_on_every_change() {
        let settings = settings();
        let portal = Rc::new(RefCell::new(Portal::default()));
        portal.borrow_mut().fetches = ["A", "A", "B", "B", "A"].into_iter().map(Some).collect();
        let clock = FakeClock::new();
        let mut m = monitor(&settings, &portal, &clock);

        assert_eq!(m.step(), Step::LoggedIn);
        let steps: Vec<Step> = (0..5).map(|_| m.step()).collect();
        assert_eq!(
            steps,
            vec![
                Step::Changed("A".to_string()),
                Step::Unchanged("A".to_string()),
                Step::Changed("B".to_string()),
                Step::Unchanged("B".to_string()),
                Step::Changed("A".to_string()),
            ]
        );
        assert_eq!(m.notifier.0, vec!["A", "B", "A"]);
        assert_eq!(m.tracker.last.as_deref(), Some("A"));
        assert_eq!(portal.borrow().sessions, 1);
    }

    #[test]
    fn test_first_fetch_immediate_then_interval() {
        let settings = settings();
        let portal = Rc::new(RefCell::new(Portal::default()));
        portal.borrow_mut().fetches = ["A", "A"].into_iter().map(Some).collect();
        let clock = FakeClock::new();
        let mut m = monitor(&settings, &portal, &clock);

        m.step();
        m.step();
        assert!(clock.take_sleeps().is_empty());
        m.step();
        assert_eq!(clock.take_sleeps(), vec![settings.interval]);
    }

    #[test]
    fn test_slow_fetch_does_not_shift_schedule() {
        let settings = settings();
        let portal = Rc::new(RefCell::new(Portal::default()));
        portal.borrow_mut().fetches = ["A", "A"].into_iter().map(Some).collect();
        let clock = FakeClock::new();
        let mut m = monitor(&settings, &portal, &clock);

        m.step();
        m.step();
        // Time passes outside the monitor, e.g. a slow response.
        clock.now.set(clock.now.get() + Duration::from_secs(600));
        m.step();
        assert_eq!(clock.take_sleeps(), vec![Duration::from_secs(3000)]);
    }

    #[test]
    fn test_oversized_interval_does_not_panic() {
        let mut settings = settings();
        settings.interval = Duration::from_secs(u64::MAX / 2);
        let portal = Rc::new(RefCell::new(Portal::default()));
        portal.borrow_mut().fetches = ["A", "A"].into_iter().map(Some).collect();
        let clock = FakeClock::new();
        let mut m = monitor(&settings, &portal, &clock);

        assert_eq!(m.step(), Step::LoggedIn);
        assert_eq!(m.step(), Step::Changed("A".to_string()));
        assert_eq!(m.step(), Step::Unchanged("A".to_string()));
        assert_eq!(clock.take_sleeps(), vec![MAX_INTERVAL]);
    }

    #[test]
    fn test_login_failure_retries_with_fresh_session() {
        let settings = settings();
        let portal = Rc::new(RefCell::new(Portal::default()));
        portal.borrow_mut().logins = [false, false, true].into_iter().collect();
        let clock = FakeClock::new();
        let mut m = monitor(&settings, &portal, &clock);

        assert_eq!(m.step(), Step::LoginFailed);
        assert!(!matches!(m.state, State::Polling { .. }));
        assert_eq!(m.step(), Step::LoginFailed);
        assert_eq!(m.step(), Step::LoggedIn);
        assert!(matches!(m.state, State::Polling { .. }));
        assert_eq!(clock.take_sleeps(), vec![settings.cooldown, settings.cooldown]);
        assert_eq!(portal.borrow().sessions, 3);
    }

    #[test]
    fn test_fetch_failure_forces_new_login() {
        let settings = settings();
        let portal = Rc::new(RefCell::new(Portal::default()));
        portal.borrow_mut().fetches = [Some("A"), None, Some("A")].into_iter().collect();
        let clock = FakeClock::new();
        let mut m = monitor(&settings, &portal, &clock);

        assert_eq!(m.step(), Step::LoggedIn);
        assert_eq!(m.step(), Step::Changed("A".to_string()));
        clock.take_sleeps();

        assert_eq!(m.step(), Step::FetchFailed);
        assert!(!matches!(m.state, State::Polling { .. }));
        assert_eq!(
            clock.take_sleeps(),
            vec![settings.interval, settings.cooldown]
        );

        assert_eq!(m.step(), Step::LoggedIn);
        assert_eq!(m.step(), Step::Unchanged("A".to_string()));
        assert_eq!(m.notifier.0, vec!["A"]);

        let portal = portal.borrow();
        assert_eq!(portal.sessions, 2);
        let (last_session, last_url) = portal.requests.last().unwrap();
        assert_eq!(*last_session, 2);
        assert_eq!(last_url, "https://www.tesla.com/teslaaccount/profile?rn=RN7");
    }

    #[test]
    fn test_change_line_format() {
        let at = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        assert_eq!(
            change_line(&at, "March 2024"),
            "2024-03-01T09:30:00Z: New Delivery Date! March 2024"
        );

        let offset = chrono::FixedOffset::west_opt(8 * 3600).unwrap();
        let at = offset.with_ymd_and_hms(2024, 3, 1, 1, 30, 0).unwrap();
        assert_eq!(
            change_line(&at, "April"),
            "2024-03-01T01:30:00-08:00: New Delivery Date! April"
        );
    }
}
