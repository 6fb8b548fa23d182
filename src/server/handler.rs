//! russh server callbacks for one inbound connection
//!
//! Authentication binds an `AuthenticatedUser` onto the `Connection`. Channel
//! opens register a `Client` and every sub-request is one `Request`
//! transition under the client's lock.

use std::sync::Arc;

use russh::keys::PublicKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::auth::authenticate;
use super::registry::Connection;
use super::request::{ChannelKind, HostPort, Negotiation, Request, X11Params};
use crate::backend::ChannelEndpoint;
use crate::bastion::Bastion;
use crate::ssh::keys::{body_fingerprint, offered_key_body};
use crate::ssh::SshError;

/// Only public-key auth is advertised
pub fn allowed_methods() -> MethodSet {
    let mut methods = MethodSet::empty();
    methods.push(MethodKind::PublicKey);
    methods
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: Some(allowed_methods()),
        partial_success: false,
    }
}

pub struct BastionHandler {
    ctx: Arc<Bastion>,
    connection: Arc<Connection>,
    opened_tx: mpsc::UnboundedSender<u32>,
}

impl BastionHandler {
    pub fn new(
        ctx: Arc<Bastion>,
        connection: Arc<Connection>,
        opened_tx: mpsc::UnboundedSender<u32>,
    ) -> Self {
        Self {
            ctx,
            connection,
            opened_tx,
        }
    }

    fn open_client(&self, channel: Channel<Msg>, kind: ChannelKind) -> Option<u32> {
        if self.connection.user().is_none() {
            info!("Channel open before auth on {}", self.connection.id);
            return None;
        }
        let id = u32::from(channel.id());
        self.connection
            .new_client(id, kind, Box::new(ChannelEndpoint::new(channel)));
        Some(id)
    }

    /// Queue a freshly opened client for the accept loop
    fn announce(&self, id: u32) {
        if self.opened_tx.send(id).is_err() {
            debug!("Accept loop gone for {}", self.connection.id);
        }
    }

    /// Apply a transition to the channel's request and raise what it asks for.
    /// Returns false for an unknown channel.
    fn negotiate<F>(&self, channel: ChannelId, transition: F) -> bool
    where
        F: FnOnce(&mut Request) -> Negotiation,
    {
        self.negotiate_id(u32::from(channel), transition)
    }

    fn negotiate_id<F>(&self, id: u32, transition: F) -> bool
    where
        F: FnOnce(&mut Request) -> Negotiation,
    {
        let Some(client) = self.connection.get_client(id) else {
            debug!("Request for unknown channel {} on {}", id, self.connection.id);
            return false;
        };
        let step = transition(&mut *client.request());
        match step {
            Negotiation::Pending => {}
            Negotiation::Ready => self.connection.ready().set(),
            Negotiation::Resize => client.notify_resize(),
        }
        true
    }

    fn reply(session: &mut Session, channel: ChannelId, ok: bool) -> Result<(), SshError> {
        if ok {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }
}

impl russh::server::Handler for BastionHandler {
    type Error = SshError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!("Auth none from {} on {}", user, self.connection.id);
        Ok(reject())
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        info!(
            "Password auth refused for {} from {:?}",
            user, self.connection.remote_addr
        );
        Ok(reject())
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let body = offered_key_body(public_key);
        match authenticate(self.ctx.directory.as_ref(), user, &body).await {
            Ok(authenticated) => {
                info!(
                    conn_id = %self.connection.id,
                    "Auth accepted: {} -> instance {} ({})",
                    user, authenticated.instance_name, authenticated.instance_id
                );
                self.connection.set_user(authenticated);
                Ok(Auth::Accept)
            }
            Err(e) => {
                info!(
                    conn_id = %self.connection.id,
                    "Auth rejected for {} from {:?} (key {}): {}",
                    user,
                    self.connection.remote_addr,
                    body_fingerprint(&body).unwrap_or_default(),
                    e
                );
                Ok(reject())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Check channel request: session {:?}", channel.id());
        match self.open_client(channel, ChannelKind::Session) {
            Some(id) => {
                self.announce(id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!(
            "Check channel direct tcpip request: {:?} {}:{} -> {}:{}",
            channel.id(),
            originator_address,
            originator_port,
            host_to_connect,
            port_to_connect
        );
        let channel_id = channel.id();
        let Some(id) = self.open_client(channel, ChannelKind::DirectTcpip) else {
            return Ok(false);
        };
        let destination = HostPort {
            host: host_to_connect.to_string(),
            port: port_to_connect,
        };
        let origin = HostPort {
            host: originator_address.to_string(),
            port: originator_port,
        };
        self.negotiate(channel_id, |r| r.on_direct_tcpip(destination, origin));
        self.announce(id);
        Ok(true)
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Check channel request: x11 {:?} from {}:{}",
            channel.id(),
            originator_address,
            originator_port
        );
        match self.open_client(channel, ChannelKind::Other("x11".to_string())) {
            Some(id) => {
                self.announce(id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Check channel pty request: {} {} {} {} {}",
            term, col_width, row_height, pix_width, pix_height
        );
        let ok = self.negotiate(channel, |r| {
            r.on_pty(term, col_width, row_height, pix_width, pix_height)
        });
        Self::reply(session, channel, ok)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Check channel shell request: {:?}", channel);
        let ok = self.negotiate(channel, Request::on_shell);
        Self::reply(session, channel, ok)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Check channel exec request: `{}`",
            String::from_utf8_lossy(data)
        );
        let ok = self.negotiate(channel, |r| r.on_exec(data));
        Self::reply(session, channel, ok)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Check channel subsystem request: {}", name);
        self.negotiate(channel, |r| r.on_subsystem(name));
        Self::reply(session, channel, false)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Check channel env request: {:?}, {}, {}",
            channel, variable_name, variable_value
        );
        self.negotiate(channel, |r| r.on_env(variable_name, variable_value));
        Self::reply(session, channel, false)
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.negotiate(channel, |r| {
            r.on_window_change(col_width, row_height, pix_width, pix_height)
        });
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Check channel x11 request {} {} {} {}",
            single_connection, x11_auth_protocol, x11_auth_cookie, x11_screen_number
        );
        let params = X11Params {
            single_connection,
            auth_protocol: x11_auth_protocol.to_string(),
            auth_cookie: x11_auth_cookie.to_string(),
            screen_number: x11_screen_number,
        };
        self.negotiate(channel, |r| r.on_x11(params));
        Self::reply(session, channel, false)
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Check channel forward agent request: {:?}", channel);
        Ok(self.negotiate(channel, Request::on_forward_agent))
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!("Check channel port forward request: {} {}", address, port);
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::server::Client;
    use crate::testing::{test_bastion, web1_user, MockEndpoint, MockRuntime};

    const CHANNEL: u32 = 7;

    type Transition = Box<dyn FnOnce(&mut Request) -> Negotiation>;

    fn handler(kind: ChannelKind) -> (BastionHandler, Arc<Connection>, Arc<Client>) {
        let connection = Arc::new(Connection::new(None, crate::config::LOGIN_FROM));
        connection.set_user(web1_user());
        let client = connection.new_client(CHANNEL, kind, Box::new(MockEndpoint::pair().0));
        let (tx, _rx) = mpsc::unbounded_channel();
        let handler = BastionHandler::new(
            test_bastion(Arc::new(MockRuntime::new(false))),
            connection.clone(),
            tx,
        );
        (handler, connection, client)
    }

    async fn resize_signalled(client: &Client) -> bool {
        tokio::time::timeout(Duration::from_millis(50), client.resized())
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn test_terminal_requests_raise_ready() {
        let cases: Vec<(ChannelKind, Transition)> = vec![
            (
                ChannelKind::Session,
                Box::new(|r: &mut Request| r.on_pty("xterm", 80, 24, 0, 0)),
            ),
            (ChannelKind::Session, Box::new(|r: &mut Request| r.on_exec(b"uptime"))),
            (ChannelKind::Session, Box::new(|r: &mut Request| r.on_subsystem("sftp"))),
            (ChannelKind::Session, Box::new(Request::on_forward_agent)),
            (
                ChannelKind::DirectTcpip,
                Box::new(|r: &mut Request| {
                    r.on_direct_tcpip(
                        HostPort {
                            host: "172.18.0.5".to_string(),
                            port: 80,
                        },
                        HostPort {
                            host: "127.0.0.1".to_string(),
                            port: 50022,
                        },
                    )
                }),
            ),
        ];

        for (kind, transition) in cases {
            let (handler, connection, client) = handler(kind);
            assert!(handler.negotiate_id(CHANNEL, transition));
            assert!(connection.ready().is_set());
            assert!(!resize_signalled(&client).await);
        }
    }

    #[tokio::test]
    async fn test_window_change_raises_resize_only() {
        let (handler, connection, client) = handler(ChannelKind::Session);
        assert!(handler.negotiate_id(CHANNEL, |r| r.on_window_change(120, 40, 0, 0)));

        assert!(!connection.ready().is_set());
        assert!(resize_signalled(&client).await);
        assert_eq!(client.request_snapshot().terminal().1, 120);
    }

    #[tokio::test]
    async fn test_pending_requests_raise_nothing() {
        let cases: Vec<Transition> = vec![
            Box::new(Request::on_shell),
            Box::new(|r: &mut Request| r.on_env("LANG", "C.UTF-8")),
            Box::new(|r: &mut Request| {
                r.on_x11(X11Params {
                    single_connection: false,
                    auth_protocol: "MIT-MAGIC-COOKIE-1".to_string(),
                    auth_cookie: "0123abcd".to_string(),
                    screen_number: 0,
                })
            }),
        ];

        for transition in cases {
            let (handler, connection, client) = handler(ChannelKind::Session);
            assert!(handler.negotiate_id(CHANNEL, transition));
            assert!(!connection.ready().is_set());
            assert!(!resize_signalled(&client).await);
        }
    }

    #[tokio::test]
    async fn test_unknown_channel_is_refused() {
        let (handler, connection, _client) = handler(ChannelKind::Session);
        assert!(!handler.negotiate_id(CHANNEL + 1, |r| r.on_pty("xterm", 80, 24, 0, 0)));
        assert!(!connection.ready().is_set());
    }

    #[test]
    fn test_reject_is_final_and_publickey_only() {
        match reject() {
            Auth::Reject {
                proceed_with_methods: Some(methods),
                partial_success,
            } => {
                assert!(!partial_success);
                assert_eq!(format!("{:?}", methods), format!("{:?}", allowed_methods()));
            }
            _ => panic!("expected a rejection"),
        }
    }
}
