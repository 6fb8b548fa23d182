//! Per-channel negotiation state
//!
//! SSH sub-requests arrive one at a time after channel-open. Each one is a
//! transition on `Request` that returns the signal the handler must raise.

use std::collections::HashMap;
use std::fmt;

pub const DEFAULT_TERM: &str = "xterm";
pub const DEFAULT_WIDTH: u32 = 80;
pub const DEFAULT_HEIGHT: u32 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Session,
    DirectTcpip,
    Other(String),
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Session => write!(f, "session"),
            ChannelKind::DirectTcpip => write!(f, "direct-tcpip"),
            ChannelKind::Other(kind) => write!(f, "{}", kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Pty,
    Exec,
    Subsystem,
    DirectTcpip,
    X11,
    ForwardAgent,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestType::Pty => "pty",
            RequestType::Exec => "exec",
            RequestType::Subsystem => "subsystem",
            RequestType::DirectTcpip => "direct-tcpip",
            RequestType::X11 => "x11",
            RequestType::ForwardAgent => "forward-agent",
        };
        write!(f, "{}", name)
    }
}

/// What the negotiation layer must do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// More sub-requests expected
    Pending,
    /// Raise the connection's ready signal
    Ready,
    /// Raise the client's resize signal
    Resize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u32,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Params {
    pub single_connection: bool,
    pub auth_protocol: String,
    pub auth_cookie: String,
    pub screen_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: ChannelKind,
    pub request_type: Option<RequestType>,
    pub term: Option<String>,
    pub width: u32,
    pub height: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub command: Option<String>,
    pub subsystem: Option<String>,
    pub shell: bool,
    pub env: HashMap<String, String>,
    pub origin: Option<HostPort>,
    pub destination: Option<HostPort>,
    pub x11: Option<X11Params>,
    pub forward_agent: bool,
}

impl Request {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            request_type: None,
            term: None,
            width: 0,
            height: 0,
            pixel_width: 0,
            pixel_height: 0,
            command: None,
            subsystem: None,
            shell: false,
            env: HashMap::new(),
            origin: None,
            destination: None,
            x11: None,
            forward_agent: false,
        }
    }

    pub fn on_pty(
        &mut self,
        term: &str,
        width: u32,
        height: u32,
        pixel_width: u32,
        pixel_height: u32,
    ) -> Negotiation {
        self.request_type = Some(RequestType::Pty);
        self.term = Some(term.to_string());
        self.set_size(width, height, pixel_width, pixel_height);
        Negotiation::Ready
    }

    pub fn on_exec(&mut self, command: &[u8]) -> Negotiation {
        self.request_type = Some(RequestType::Exec);
        self.command = Some(String::from_utf8_lossy(command).into_owned());
        Negotiation::Ready
    }

    pub fn on_subsystem(&mut self, name: &str) -> Negotiation {
        self.request_type = Some(RequestType::Subsystem);
        self.subsystem = Some(name.to_string());
        Negotiation::Ready
    }

    pub fn on_shell(&mut self) -> Negotiation {
        self.shell = true;
        Negotiation::Pending
    }

    pub fn on_env(&mut self, name: &str, value: &str) -> Negotiation {
        self.env.insert(name.to_string(), value.to_string());
        Negotiation::Pending
    }

    pub fn on_direct_tcpip(&mut self, destination: HostPort, origin: HostPort) -> Negotiation {
        self.kind = ChannelKind::DirectTcpip;
        self.request_type = Some(RequestType::DirectTcpip);
        self.destination = Some(destination);
        self.origin = Some(origin);
        Negotiation::Ready
    }

    pub fn on_window_change(
        &mut self,
        width: u32,
        height: u32,
        pixel_width: u32,
        pixel_height: u32,
    ) -> Negotiation {
        self.set_size(width, height, pixel_width, pixel_height);
        Negotiation::Resize
    }

    pub fn on_x11(&mut self, params: X11Params) -> Negotiation {
        self.x11 = Some(params);
        Negotiation::Pending
    }

    pub fn on_forward_agent(&mut self) -> Negotiation {
        self.forward_agent = true;
        Negotiation::Ready
    }

    fn set_size(&mut self, width: u32, height: u32, pixel_width: u32, pixel_height: u32) {
        self.width = width;
        self.height = height;
        self.pixel_width = pixel_width;
        self.pixel_height = pixel_height;
    }

    pub fn has_pty(&self) -> bool {
        self.term.is_some()
    }

    /// Terminal type and size, with defaults for anything not negotiated
    pub fn terminal(&self) -> (String, u32, u32) {
        let term = self
            .term
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TERM.to_string());
        let width = if self.width == 0 { DEFAULT_WIDTH } else { self.width };
        let height = if self.height == 0 { DEFAULT_HEIGHT } else { self.height };
        (term, width, height)
    }

    /// `kind:type` as shown to users on rejection
    pub fn route(&self) -> String {
        match self.request_type {
            Some(t) => format!("{}:{}", self.kind, t),
            None => format!("{}:None", self.kind),
        }
    }

    /// Whether the dispatcher bridges this channel at all
    pub fn is_interactive(&self) -> bool {
        let kind_ok = matches!(self.kind, ChannelKind::Session | ChannelKind::DirectTcpip);
        let type_ok = matches!(
            self.request_type,
            Some(RequestType::Pty)
                | Some(RequestType::X11)
                | Some(RequestType::ForwardAgent)
                | Some(RequestType::DirectTcpip)
        );
        kind_ok && type_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pty_is_ready_and_shell_only_flags() {
        let mut request = Request::new(ChannelKind::Session);
        assert_eq!(request.on_pty("xterm-256color", 80, 24, 0, 0), Negotiation::Ready);
        assert_eq!(request.on_shell(), Negotiation::Pending);
        assert!(request.shell);
        assert!(request.is_interactive());
        assert_eq!(request.route(), "session:pty");
    }

    #[test]
    fn test_exec_and_subsystem_signal_ready_but_are_not_interactive() {
        let mut request = Request::new(ChannelKind::Session);
        assert_eq!(request.on_exec(b"uptime"), Negotiation::Ready);
        assert_eq!(request.command.as_deref(), Some("uptime"));
        assert!(!request.is_interactive());
        assert_eq!(request.route(), "session:exec");

        let mut request = Request::new(ChannelKind::Session);
        assert_eq!(request.on_subsystem("sftp"), Negotiation::Ready);
        assert!(!request.is_interactive());
        assert_eq!(request.route(), "session:subsystem");
    }

    #[test]
    fn test_window_change_updates_size_and_asks_for_resize() {
        let mut request = Request::new(ChannelKind::Session);
        request.on_pty("xterm", 80, 24, 640, 480);
        assert_eq!(request.on_window_change(120, 40, 0, 0), Negotiation::Resize);
        assert_eq!((request.width, request.height), (120, 40));
        assert_eq!(request.pixel_width, 0);
        assert_eq!(request.request_type, Some(RequestType::Pty));
    }

    #[test]
    fn test_direct_tcpip_sets_kind_and_type() {
        let mut request = Request::new(ChannelKind::DirectTcpip);
        let step = request.on_direct_tcpip(
            HostPort { host: "172.18.0.5".to_string(), port: 8080 },
            HostPort { host: "127.0.0.1".to_string(), port: 50000 },
        );
        assert_eq!(step, Negotiation::Ready);
        assert_eq!(request.route(), "direct-tcpip:direct-tcpip");
        assert!(request.is_interactive());
    }

    #[test]
    fn test_env_and_x11_are_recorded_only() {
        let mut request = Request::new(ChannelKind::Session);
        assert_eq!(request.on_env("LANG", "C.UTF-8"), Negotiation::Pending);
        assert_eq!(
            request.on_x11(X11Params {
                single_connection: false,
                auth_protocol: "MIT-MAGIC-COOKIE-1".to_string(),
                auth_cookie: "abcd".to_string(),
                screen_number: 0,
            }),
            Negotiation::Pending
        );
        assert_eq!(request.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert!(request.x11.is_some());
        assert_eq!(request.request_type, None);
        assert_eq!(request.route(), "session:None");
        assert!(!request.is_interactive());
    }

    #[test]
    fn test_terminal_defaults() {
        let request = Request::new(ChannelKind::Session);
        assert_eq!(request.terminal(), ("xterm".to_string(), 80, 24));
        assert!(!request.has_pty());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut request = Request::new(ChannelKind::Other("x11".to_string()));
        request.on_pty("xterm", 80, 24, 0, 0);
        assert!(!request.is_interactive());
        assert_eq!(request.route(), "x11:pty");
    }
}
