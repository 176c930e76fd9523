//! Per-network session state machine.
//!
//! Tracks registration, the current nick and channel membership for one
//! connection. A fresh `Session` is created for every connection; it never
//! performs I/O. Each call to [`Session::handle`] mutates state and returns
//! a [`Transition`]: lines to write, notices to publish and an optional
//! disconnect request. The caller applies the transition only after the
//! state change is committed.

use crate::app::event::{is_channel_name, Event, Scope};
use crate::config::nickname::alternate_nick;
use crate::config::{CoreConfig, NetworkConfig};
use crate::irc::codec::Line;
use irc::proto::{Command, Response};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Registration {
    Unregistered,
    Registering,
    Registered,
    Errored,
    Disconnected,
}

impl fmt::Display for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Registration::Unregistered => "unregistered",
            Registration::Registering => "registering",
            Registration::Registered => "registered",
            Registration::Errored => "errored",
            Registration::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Nick collision handling shared by all sessions.
#[derive(Debug, Clone)]
pub struct NickPolicy {
    pub max_retries: u32,
    pub suffix: String,
}

impl From<&CoreConfig> for NickPolicy {
    fn from(core: &CoreConfig) -> Self {
        Self {
            max_retries: core.max_nick_retries,
            suffix: core.nick_suffix.clone(),
        }
    }
}

/// Something observable that happened, destined for the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub scope: Scope,
    pub kind: String,
    pub line: Option<Line>,
    /// Parameters for notices not backed by a protocol line.
    pub detail: Vec<String>,
}

impl Notice {
    fn line(scope: Scope, kind: &str, line: &Line) -> Self {
        Self {
            scope,
            kind: kind.to_string(),
            line: Some(line.clone()),
            detail: Vec::new(),
        }
    }

    pub fn bare(scope: Scope, kind: &str, detail: Vec<String>) -> Self {
        Self {
            scope,
            kind: kind.to_string(),
            line: None,
            detail,
        }
    }
}

#[derive(Debug, Default)]
pub struct Transition {
    /// Lines to write, in order.
    pub send: Vec<String>,
    pub notices: Vec<Notice>,
    pub disconnect: Option<String>,
}

#[derive(Debug)]
pub struct Session {
    config: NetworkConfig,
    policy: NickPolicy,
    nick: String,
    state: Registration,
    nick_attempts: u32,
    registering_since: Option<Instant>,
    /// Lower-cased channel name to lower-cased member nicks.
    channels: BTreeMap<String, BTreeSet<String>>,
}

impl Session {
    pub fn new(config: &NetworkConfig, policy: &NickPolicy) -> Self {
        Self {
            config: config.clone(),
            policy: policy.clone(),
            nick: config.nickname.clone(),
            state: Registration::Unregistered,
            nick_attempts: 0,
            registering_since: None,
            channels: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> Registration {
        self.state
    }

    fn is_me(&self, nick: &str) -> bool {
        nick.eq_ignore_ascii_case(&self.nick)
    }

    /// Turn echoes of our own JOIN/PART/KICK into acknowledgement events.
    pub fn classify(&self, line: Line) -> Event {
        let me = line.source_nick().map(|n| self.is_me(n)).unwrap_or(false);
        match &line.message.command {
            Command::JOIN(chan, _, _) if me => Event::JoinAck {
                channel: chan.clone(),
                line,
            },
            Command::PART(chan, _) if me => Event::PartAck {
                channel: chan.clone(),
                line,
            },
            Command::KICK(chan, user, _) if self.is_me(user) => Event::PartAck {
                channel: chan.clone(),
                line,
            },
            _ => Event::Line(line),
        }
    }

    pub fn handle(&mut self, event: &Event, now: Instant) -> Transition {
        match event {
            Event::Connected(_) => self.on_connected(now),
            Event::Line(line) => self.on_line(line),
            Event::JoinAck { channel, line } => self.on_join_ack(channel, line),
            Event::PartAck { channel, line } => self.on_part_ack(channel, line),
            Event::Disconnected { reason } => self.on_disconnected(reason),
            Event::Error(_) | Event::Reconnecting { .. } | Event::GaveUp { .. } => {
                Transition::default()
            }
        }
    }

    /// True once registration has been pending longer than `timeout`.
    pub fn registration_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.state == Registration::Registering
            && self
                .registering_since
                .map(|since| now.duration_since(since) >= timeout)
                .unwrap_or(false)
    }

    /// Mark the session Errored and request a disconnect.
    pub fn fail(&mut self, reason: &str) -> Transition {
        self.state = Registration::Errored;
        self.registering_since = None;
        Transition {
            send: Vec::new(),
            notices: vec![Notice::bare(
                Scope::Server,
                "errored",
                vec![reason.to_string()],
            )],
            disconnect: Some(reason.to_string()),
        }
    }

    fn on_connected(&mut self, now: Instant) -> Transition {
        self.state = Registration::Registering;
        self.registering_since = Some(now);
        self.nick_attempts = 0;
        self.nick = self.config.nickname.clone();
        self.channels.clear();

        let mut send = Vec::new();
        if let Some(pass) = &self.config.password {
            send.push(format!("PASS {}", pass));
        }
        send.push(format!("NICK {}", self.nick));
        send.push(format!(
            "USER {} 0 * :{}",
            self.config.username(),
            self.config.realname()
        ));
        Transition {
            send,
            notices: vec![Notice::bare(
                Scope::Server,
                "connected",
                vec![self.nick.clone()],
            )],
            disconnect: None,
        }
    }

    fn on_disconnected(&mut self, reason: &str) -> Transition {
        self.state = Registration::Disconnected;
        self.registering_since = None;
        self.channels.clear();
        Transition {
            send: Vec::new(),
            notices: vec![Notice::bare(
                Scope::Server,
                "disconnected",
                vec![reason.to_string()],
            )],
            disconnect: None,
        }
    }

    fn on_join_ack(&mut self, channel: &str, line: &Line) -> Transition {
        let key = channel.to_ascii_lowercase();
        let nick = self.nick.to_ascii_lowercase();
        self.channels.entry(key).or_default().insert(nick);
        single(Notice::line(Scope::channel(channel), "join", line))
    }

    fn on_part_ack(&mut self, channel: &str, line: &Line) -> Transition {
        self.channels.remove(&channel.to_ascii_lowercase());
        let kind = line.command.to_ascii_lowercase();
        single(Notice::line(Scope::channel(channel), &kind, line))
    }

    fn on_line(&mut self, line: &Line) -> Transition {
        let kind = line.command.to_ascii_lowercase();
        let from = line.source_nick().map(str::to_ascii_lowercase);

        match &line.message.command {
            // Keepalive is handled by the connection.
            Command::PING(..) | Command::PONG(..) => Transition::default(),

            Command::Response(Response::RPL_WELCOME, args) => self.on_welcome(args, line),

            Command::Response(Response::ERR_NICKNAMEINUSE, _)
            | Command::Response(Response::ERR_NICKCOLLISION, _)
            | Command::Response(Response::ERR_ERRONEOUSNICKNAME, _)
                if self.state == Registration::Registering =>
            {
                self.on_nick_rejected(line)
            }

            Command::Response(Response::RPL_NAMREPLY, args) if args.len() >= 4 => {
                if let Some(m) = self.channels.get_mut(&args[2].to_ascii_lowercase()) {
                    for name in args[3].split_whitespace() {
                        let nick = name.trim_start_matches(['~', '&', '@', '%', '+']);
                        if !nick.is_empty() {
                            m.insert(nick.to_ascii_lowercase());
                        }
                    }
                }
                single(Notice::line(Scope::channel(&args[2]), &kind, line))
            }

            Command::JOIN(chan, _, _) => {
                if let (Some(m), Some(nick)) =
                    (self.channels.get_mut(&chan.to_ascii_lowercase()), &from)
                {
                    m.insert(nick.clone());
                }
                single(Notice::line(Scope::channel(chan), &kind, line))
            }
            Command::PART(chan, _) => {
                if let (Some(m), Some(nick)) =
                    (self.channels.get_mut(&chan.to_ascii_lowercase()), &from)
                {
                    m.remove(nick);
                }
                single(Notice::line(Scope::channel(chan), &kind, line))
            }
            Command::KICK(chan, user, _) => {
                if let Some(m) = self.channels.get_mut(&chan.to_ascii_lowercase()) {
                    m.remove(&user.to_ascii_lowercase());
                }
                single(Notice::line(Scope::channel(chan), &kind, line))
            }

            Command::QUIT(_) => {
                let Some(nick) = from else {
                    return single(Notice::line(Scope::Server, &kind, line));
                };
                let mut notices = Vec::new();
                for (key, m) in self.channels.iter_mut() {
                    if m.remove(&nick) {
                        notices.push(Notice::line(Scope::Channel(key.clone()), &kind, line));
                    }
                }
                or_server(notices, &kind, line)
            }

            Command::NICK(new_nick) => {
                let Some(old) = from else {
                    return single(Notice::line(Scope::Server, &kind, line));
                };
                if self.is_me(&old) {
                    self.nick = new_nick.clone();
                }
                let new_key = new_nick.to_ascii_lowercase();
                let mut notices = Vec::new();
                for (key, m) in self.channels.iter_mut() {
                    if m.remove(&old) {
                        m.insert(new_key.clone());
                        notices.push(Notice::line(Scope::Channel(key.clone()), &kind, line));
                    }
                }
                or_server(notices, &kind, line)
            }

            Command::PRIVMSG(target, _) | Command::NOTICE(target, _) => {
                let scope = if is_channel_name(target) {
                    Scope::channel(target)
                } else if self.is_me(target) {
                    Scope::Private
                } else {
                    Scope::Server
                };
                single(Notice::line(scope, &kind, line))
            }

            _ => single(Notice::line(scope_of(line), &kind, line)),
        }
    }

    fn on_welcome(&mut self, args: &[String], line: &Line) -> Transition {
        if self.state != Registration::Registering {
            return single(Notice::line(Scope::Server, "001", line));
        }
        if let Some(confirmed) = args.first() {
            self.nick = confirmed.clone();
        }
        self.state = Registration::Registered;
        self.registering_since = None;
        Transition {
            send: self
                .config
                .channels
                .iter()
                .map(|c| format!("JOIN {}", c))
                .collect(),
            notices: vec![Notice::line(Scope::Server, "registered", line)],
            disconnect: None,
        }
    }

    fn on_nick_rejected(&mut self, line: &Line) -> Transition {
        self.nick_attempts += 1;
        if self.nick_attempts > self.policy.max_retries {
            return self.fail(&format!(
                "nickname unavailable after {} retries",
                self.policy.max_retries
            ));
        }
        self.nick = alternate_nick(
            &self.config.nickname,
            &self.config.alt_nicks,
            &self.policy.suffix,
            self.nick_attempts,
        );
        Transition {
            send: vec![format!("NICK {}", self.nick)],
            notices: vec![Notice::line(
                Scope::Server,
                &line.command.to_ascii_lowercase(),
                line,
            )],
            disconnect: None,
        }
    }
}

fn single(notice: Notice) -> Transition {
    Transition {
        notices: vec![notice],
        ..Transition::default()
    }
}

fn or_server(notices: Vec<Notice>, kind: &str, line: &Line) -> Transition {
    if notices.is_empty() {
        single(Notice::line(Scope::Server, kind, line))
    } else {
        Transition {
            notices,
            ..Transition::default()
        }
    }
}

/// Channel named by the first or second parameter, else the server.
fn scope_of(line: &Line) -> Scope {
    line.params
        .iter()
        .take(2)
        .find(|p| is_channel_name(p))
        .map(|p| Scope::channel(p))
        .unwrap_or(Scope::Server)
}

#[cfg(test)]
impl Session {
    pub(crate) fn nick(&self) -> &str {
        &self.nick
    }

    /// Joined channels (lower-cased).
    pub(crate) fn channels(&self) -> BTreeSet<String> {
        self.channels.keys().cloned().collect()
    }

    fn is_joined(&self, channel: &str) -> bool {
        self.channels.contains_key(&channel.to_ascii_lowercase())
    }

    fn members(&self, channel: &str) -> Option<&BTreeSet<String>> {
        self.channels.get(&channel.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::irc::connection;

    fn setup(channels: &[&str]) -> (NetworkConfig, NickPolicy) {
        let list = channels
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ");
        let toml = format!(
            "[core]\nmax_nick_retries = 2\n[[networks]]\nname = \"freenode\"\nhost = \"irc.example.net\"\nnickname = \"bot1\"\nchannels = [{}]\n",
            list
        );
        let cfg = parse_config(&toml).unwrap();
        let policy = NickPolicy::from(&cfg.core);
        (cfg.networks[0].clone(), policy)
    }

    fn connected() -> Event {
        let (handle, _lanes) = connection::channel(1, 4);
        Event::Connected(handle)
    }

    fn feed(session: &mut Session, raw: &str) -> Transition {
        let event = session.classify(Line::parse(raw).unwrap());
        session.handle(&event, Instant::now())
    }

    fn registered(channels: &[&str]) -> Session {
        let (net, policy) = setup(channels);
        let mut s = Session::new(&net, &policy);
        s.handle(&connected(), Instant::now());
        feed(&mut s, ":srv 001 bot1 :Welcome");
        s
    }

    #[test]
    fn test_connected_starts_registration() {
        let (net, policy) = setup(&["#test"]);
        let mut s = Session::new(&net, &policy);
        assert_eq!(s.state(), Registration::Unregistered);

        let t = s.handle(&connected(), Instant::now());
        assert_eq!(s.state(), Registration::Registering);
        assert_eq!(t.send, vec!["NICK bot1", "USER bot1 0 * :bot1"]);
        assert_eq!(t.notices.len(), 1);
        assert_eq!(t.notices[0].kind, "connected");
    }

    #[test]
    fn test_password_sent_first() {
        let (mut net, policy) = setup(&[]);
        net.password = Some("hunter2".to_string());
        let mut s = Session::new(&net, &policy);
        let t = s.handle(&connected(), Instant::now());
        assert_eq!(t.send[0], "PASS hunter2");
    }

    #[test]
    fn test_join_scenario() {
        let (net, policy) = setup(&["#test"]);
        let mut s = Session::new(&net, &policy);
        s.handle(&connected(), Instant::now());

        let t = feed(&mut s, ":srv 001 bot1 :Welcome to the network");
        assert_eq!(s.state(), Registration::Registered);
        assert_eq!(t.send, vec!["JOIN #test"]);
        assert_eq!(t.notices.len(), 1);
        assert_eq!(t.notices[0].kind, "registered");
        assert!(s.channels().is_empty(), "no channel before its JoinAck");

        let t = feed(&mut s, ":bot1!u@h JOIN #test");
        assert_eq!(s.channels(), BTreeSet::from(["#test".to_string()]));
        assert_eq!(t.notices.len(), 1);
        assert_eq!(t.notices[0].scope, Scope::Channel("#test".to_string()));
        assert_eq!(t.notices[0].kind, "join");
    }

    #[test]
    fn test_membership_equals_acknowledged_channels() {
        let mut s = registered(&["#a", "#b", "#c"]);
        feed(&mut s, ":bot1!u@h JOIN #a");
        feed(&mut s, ":other!u@h JOIN #b");
        feed(&mut s, ":bot1!u@h JOIN #C");
        assert_eq!(
            s.channels(),
            BTreeSet::from(["#a".to_string(), "#c".to_string()])
        );

        feed(&mut s, ":bot1!u@h PART #a :bye");
        feed(&mut s, ":op!u@h KICK #c bot1 :out");
        assert!(s.channels().is_empty());
    }

    #[test]
    fn test_kick_ack_published_as_kick() {
        let mut s = registered(&["#a"]);
        feed(&mut s, ":bot1!u@h JOIN #a");
        let t = feed(&mut s, ":op!u@h KICK #a bot1 :out");
        assert_eq!(t.notices[0].kind, "kick");
        assert!(!s.is_joined("#a"));
    }

    #[test]
    fn test_member_tracking() {
        let mut s = registered(&["#a", "#b"]);
        feed(&mut s, ":bot1!u@h JOIN #a");
        feed(&mut s, ":bot1!u@h JOIN #b");
        feed(&mut s, ":srv 353 bot1 = #a :@Op +voiced plain bot1");
        let members = s.members("#a").unwrap();
        assert!(members.contains("op"));
        assert!(members.contains("voiced"));
        assert!(members.contains("plain"));

        feed(&mut s, ":plain!u@h JOIN #b");
        let t = feed(&mut s, ":plain!u@h NICK Simple");
        assert_eq!(t.notices.len(), 2, "one nick notice per shared channel");
        assert!(s.members("#a").unwrap().contains("simple"));
        assert!(!s.members("#b").unwrap().contains("plain"));

        let t = feed(&mut s, ":simple!u@h QUIT :gone");
        assert_eq!(t.notices.len(), 2);
        assert!(!s.members("#a").unwrap().contains("simple"));

        let t = feed(&mut s, ":stranger!u@h QUIT :gone");
        assert_eq!(t.notices.len(), 1);
        assert_eq!(t.notices[0].scope, Scope::Server);

        feed(&mut s, ":op!u@h PART #a");
        feed(&mut s, ":voiced!u@h KICK #a voiced");
        let members = s.members("#a").unwrap();
        assert!(!members.contains("op"));
        assert!(!members.contains("voiced"));
    }

    #[test]
    fn test_message_scopes() {
        let mut s = registered(&[]);
        let t = feed(&mut s, ":a!u@h PRIVMSG #Chan :hello");
        assert_eq!(t.notices[0].scope, Scope::Channel("#chan".to_string()));
        assert_eq!(t.notices[0].kind, "privmsg");

        let t = feed(&mut s, ":a!u@h PRIVMSG bot1 :psst");
        assert_eq!(t.notices[0].scope, Scope::Private);

        let t = feed(&mut s, ":srv NOTICE * :*** Looking up your hostname");
        assert_eq!(t.notices[0].scope, Scope::Server);

        let t = feed(&mut s, ":srv 332 bot1 #chan :the topic");
        assert_eq!(t.notices[0].scope, Scope::Channel("#chan".to_string()));
        assert_eq!(t.notices[0].kind, "332");
    }

    #[test]
    fn test_keepalive_lines_are_silent() {
        let mut s = registered(&[]);
        for raw in ["PING :irc.example.net", ":srv PONG srv :tenyks"] {
            let t = feed(&mut s, raw);
            assert!(t.send.is_empty(), "{}", raw);
            assert!(t.notices.is_empty(), "{}", raw);
        }
    }

    #[test]
    fn test_own_nick_change() {
        let mut s = registered(&[]);
        feed(&mut s, ":bot1!u@h NICK bot2");
        assert_eq!(s.nick(), "bot2");
        // Echo of a JOIN under the new nick is still ours.
        let ev = s.classify(Line::parse(":bot2!u@h JOIN #x").unwrap());
        assert!(matches!(ev, Event::JoinAck { .. }));
    }

    #[test]
    fn test_nick_collision_retries_then_errors() {
        let (net, policy) = setup(&["#test"]);
        let mut s = Session::new(&net, &policy);
        s.handle(&connected(), Instant::now());

        let t = feed(&mut s, ":srv 433 * bot1 :Nickname is already in use");
        assert_eq!(t.send, vec!["NICK bot1_"]);
        assert_eq!(s.state(), Registration::Registering);

        let t = feed(&mut s, ":srv 433 * bot1_ :Nickname is already in use");
        assert_eq!(t.send, vec!["NICK bot1__"]);

        let t = feed(&mut s, ":srv 433 * bot1__ :Nickname is already in use");
        assert_eq!(s.state(), Registration::Errored);
        assert!(t.disconnect.is_some());
        assert!(t.send.is_empty());
        assert_eq!(t.notices[0].kind, "errored");
    }

    #[test]
    fn test_collision_then_welcome_uses_confirmed_nick() {
        let (net, policy) = setup(&[]);
        let mut s = Session::new(&net, &policy);
        s.handle(&connected(), Instant::now());
        feed(&mut s, ":srv 433 * bot1 :in use");
        feed(&mut s, ":srv 001 bot1_ :Welcome");
        assert_eq!(s.state(), Registration::Registered);
        assert_eq!(s.nick(), "bot1_");
    }

    #[test]
    fn test_433_after_registration_is_plain_line() {
        let mut s = registered(&[]);
        let t = feed(&mut s, ":srv 433 bot1 taken :Nickname is already in use");
        assert_eq!(s.state(), Registration::Registered);
        assert!(t.send.is_empty());
        assert_eq!(t.notices[0].kind, "433");
    }

    #[test]
    fn test_registration_timeout() {
        let (net, policy) = setup(&[]);
        let mut s = Session::new(&net, &policy);
        let start = Instant::now();
        s.handle(&connected(), start);
        let timeout = Duration::from_secs(60);
        assert!(!s.registration_expired(start + Duration::from_secs(10), timeout));
        assert!(s.registration_expired(start + Duration::from_secs(61), timeout));

        let t = s.fail("registration timed out");
        assert_eq!(s.state(), Registration::Errored);
        assert_eq!(t.disconnect.as_deref(), Some("registration timed out"));
        assert!(!s.registration_expired(start + Duration::from_secs(61), timeout));
    }

    #[test]
    fn test_disconnect_clears_membership() {
        let mut s = registered(&["#a"]);
        feed(&mut s, ":bot1!u@h JOIN #a");
        let t = s.handle(
            &Event::Disconnected {
                reason: "eof".to_string(),
            },
            Instant::now(),
        );
        assert_eq!(s.state(), Registration::Disconnected);
        assert!(s.channels().is_empty());
        assert_eq!(t.notices[0].kind, "disconnected");
        assert_eq!(t.notices[0].detail, vec!["eof"]);
    }
}
