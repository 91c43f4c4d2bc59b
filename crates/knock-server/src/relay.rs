//! The relay state machine.
//!
//! [`Relay`] owns the connection registry and the persistent stores. A socket
//! session calls [`Relay::open`] once after the upgrade, [`Relay::dispatch`]
//! for every text frame, and [`Relay::close`] when the socket goes away.
//!
//! Per connection the states run `Connecting → Verifying (host only) →
//! Bootstrapped → Active → Closed`. A host whose password does not match
//! goes straight from `Verifying` to `Closed` and is never registered, so a
//! failed login cannot displace the host that is already online.

use std::sync::Arc;

use knock_core::constants::{
    CLOSE_POLICY_VIOLATION, HOST_SENDER, LOGIN_FAIL_REASON, MALFORMED_PAYLOAD,
};
use knock_core::{Inbound, MailboxMessage, MessageKind, Outbound, Role, Timestamp};
use knock_store::{
    CredentialVerifier, Enqueued, KvStore, Mailbox, PendingOutcome, PermissionStore,
};
use secrecy::SecretString;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RelayOptions;
use crate::connection::Connection;
use crate::error::RelayError;
use crate::registry::ConnectionRegistry;

/// Lifecycle of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Verifying,
    Bootstrapped,
    Active,
    Closed,
}

pub struct Relay {
    registry: ConnectionRegistry,
    credentials: CredentialVerifier,
    permissions: PermissionStore,
    mailbox: Mailbox,
    options: RelayOptions,
}

impl Relay {
    pub fn new(kv: Arc<dyn KvStore>, options: RelayOptions) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            credentials: CredentialVerifier::new(Arc::clone(&kv)),
            permissions: PermissionStore::new(Arc::clone(&kv)),
            mailbox: Mailbox::new(kv),
            options,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn permissions(&self) -> &PermissionStore {
        &self.permissions
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Bring a freshly upgraded connection to `Active`, or to `Closed` when a
    /// host presents the wrong password.
    #[instrument(skip_all, fields(user_id = %conn.user_id, role = %conn.role))]
    pub async fn open(
        &self,
        conn: &Arc<Connection>,
        password: Option<&SecretString>,
    ) -> Result<SessionState, RelayError> {
        if conn.role == Role::Guest {
            self.register(conn);
            return Ok(SessionState::Active);
        }

        debug!(state = ?SessionState::Verifying, "verifying host");
        let verdict = self
            .credentials
            .verify(conn.user_id.as_str(), password)
            .await?;
        if !verdict.is_accepted() {
            let _ = conn.send(&Outbound::LoginFail {
                reason: LOGIN_FAIL_REASON.into(),
            });
            let _ = conn.close(CLOSE_POLICY_VIOLATION, LOGIN_FAIL_REASON);
            return Ok(SessionState::Closed);
        }

        self.register(conn);
        debug!(state = ?SessionState::Bootstrapped, ?verdict, "host accepted");

        let host_id = conn.user_id.as_str();
        let messages = self.mailbox.flush(host_id).await?;
        if !messages.is_empty() {
            info!(count = messages.len(), "delivering offline messages");
        }
        let _ = conn.send(&Outbound::OfflineMessages { messages });

        let snapshot = self.permissions.snapshot(host_id).await?;
        let _ = conn.send(&Outbound::permissions(snapshot));
        Ok(SessionState::Active)
    }

    fn register(&self, conn: &Arc<Connection>) {
        if let Some(displaced) = self.registry.add(Arc::clone(conn)) {
            info!(displaced = %displaced.id, "connection replaced an existing one for this id");
        }
        info!(conn_id = %conn.id, online = self.registry.count(), "connection registered");
    }

    /// Handle one inbound text frame. Failures are answered on `conn` with the
    /// generic `error` frame; the connection stays usable.
    pub async fn dispatch(&self, conn: &Connection, text: &str) {
        let result = match Inbound::parse(text) {
            Ok(frame) => self.handle(conn, frame).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            match &e {
                RelayError::Protocol(_) => {
                    warn!(user_id = %conn.user_id, class = e.class(), error = %e, "rejected frame");
                }
                RelayError::Store(_) => {
                    error!(user_id = %conn.user_id, class = e.class(), error = %e, "frame failed");
                }
            }
            let _ = conn.send(&Outbound::Error {
                message: MALFORMED_PAYLOAD.into(),
            });
        }
    }

    #[instrument(skip_all, fields(user_id = %conn.user_id, role = %conn.role, kind = frame.kind()))]
    async fn handle(&self, conn: &Connection, frame: Inbound) -> Result<(), RelayError> {
        match (conn.role, frame) {
            (
                Role::Guest,
                Inbound::VerifyRequest {
                    guest_id,
                    from,
                    content,
                    time,
                    to,
                },
            ) => self.verify_request(guest_id, from, content, time, &to).await,
            (Role::Host, Inbound::AllowGuest { guest_id, nickname }) => {
                let snapshot = self
                    .permissions
                    .approve(conn.user_id.as_str(), &guest_id, nickname)
                    .await?;
                let _ = conn.send(&Outbound::permissions(snapshot));
                self.notify_guest(conn, &guest_id, &Outbound::VerifyPass);
                Ok(())
            }
            (Role::Host, Inbound::RejectGuest { guest_id }) => {
                let snapshot = self
                    .permissions
                    .reject(conn.user_id.as_str(), &guest_id)
                    .await?;
                let _ = conn.send(&Outbound::permissions(snapshot));
                self.notify_guest(conn, &guest_id, &Outbound::VerifyReject);
                Ok(())
            }
            (Role::Host, Inbound::RemoveGuest { guest_id }) => {
                let snapshot = self
                    .permissions
                    .revoke(conn.user_id.as_str(), &guest_id)
                    .await?;
                let _ = conn.send(&Outbound::permissions(snapshot));
                Ok(())
            }
            (
                Role::Guest,
                Inbound::Message {
                    guest_id,
                    from,
                    content,
                    time,
                    to,
                },
            ) => {
                let (Some(guest_id), Some(to)) = (guest_id, to) else {
                    debug!("guest message without guestId or to, dropped");
                    return Ok(());
                };
                let from = from.unwrap_or_else(|| guest_id.clone());
                self.guest_message(conn, guest_id, from, content, time, to)
                    .await
            }
            (Role::Host, Inbound::Message { content, time, to, .. }) => {
                self.host_message(to.as_deref(), content, time);
                Ok(())
            }
            (role, frame) => {
                debug!(%role, kind = frame.kind(), "frame not permitted for role, ignored");
                Ok(())
            }
        }
    }

    async fn verify_request(
        &self,
        guest_id: String,
        from: String,
        content: Value,
        time: Option<Timestamp>,
        host_id: &str,
    ) -> Result<(), RelayError> {
        let outcome = self
            .permissions
            .add_pending(host_id, &guest_id, Some(from.clone()))
            .await?;
        let host = self.registry.lookup_role(host_id, Role::Host);

        match outcome {
            PendingOutcome::AlreadyAllowed(_) => {
                if let Some(host) = host {
                    let _ = host.send(&Outbound::Message {
                        from,
                        guest_id: Some(guest_id),
                        content,
                        time,
                    });
                }
            }
            PendingOutcome::Added(snapshot) => {
                info!(host_id, guest_id = %guest_id, "guest awaiting approval");
                if let Some(host) = host {
                    let _ = host.send(&Outbound::VerifyRequest {
                        guest_id,
                        from,
                        content,
                        time,
                    });
                    let _ = host.send(&Outbound::permissions(snapshot));
                }
            }
            PendingOutcome::AlreadyPending => {
                debug!(host_id, guest_id = %guest_id, "verification already pending");
            }
        }
        Ok(())
    }

    async fn guest_message(
        &self,
        conn: &Connection,
        guest_id: String,
        from: String,
        content: Value,
        time: Option<Timestamp>,
        host_id: String,
    ) -> Result<(), RelayError> {
        let snapshot = self.permissions.snapshot(&host_id).await?;
        if !snapshot.is_allowed(&guest_id) {
            debug!(host_id = %host_id, guest_id = %guest_id, "guest not approved, message dropped");
            if self.options.notify_denied {
                let _ = conn.send(&Outbound::PermissionDenied { guest_id });
            }
            return Ok(());
        }

        let mut message = MailboxMessage {
            kind: MessageKind::Message,
            from,
            guest_id: Some(guest_id),
            content,
            time,
            to: Some(host_id.clone()),
        };
        // The host may log in between the lookup and the enqueue, so the
        // mailbox looks again under the lock its login flush takes.
        loop {
            if let Some(host) = self.registry.lookup_role(&host_id, Role::Host) {
                let _ = host.send(&live_frame(message));
                return Ok(());
            }
            let outcome = self
                .mailbox
                .enqueue_unless(&host_id, message, || {
                    self.registry.lookup_role(&host_id, Role::Host).is_some()
                })
                .await?;
            match outcome {
                Enqueued::Queued(depth) => {
                    debug!(host_id = %host_id, depth, "host offline, message queued");
                    return Ok(());
                }
                Enqueued::Declined(returned) => {
                    debug!(host_id = %host_id, "host came online, delivering live");
                    message = returned;
                }
            }
        }
    }

    // Host messages are never queued; offline guests simply miss them.
    fn host_message(&self, to: Option<&str>, content: Value, time: Option<Timestamp>) {
        let frame = Outbound::Message {
            from: HOST_SENDER.into(),
            guest_id: None,
            content,
            time,
        };
        match to {
            Some(guest_id) => match self.registry.lookup_role(guest_id, Role::Guest) {
                Some(guest) => {
                    let _ = guest.send(&frame);
                }
                None => debug!(guest_id, "guest offline, host message dropped"),
            },
            None => {
                let guests = self.registry.guests();
                debug!(recipients = guests.len(), "broadcasting host message");
                for guest in guests {
                    let _ = guest.send(&frame);
                }
            }
        }
    }

    /// Tell a waiting guest how the host decided. The notice goes to the
    /// longest-connected guest that is not the sender, which need not be the
    /// guest named in the decision.
    fn notify_guest(&self, sender: &Connection, guest_id: &str, frame: &Outbound) {
        let Some(guest) = self.registry.first_guest_except(&sender.id) else {
            debug!(guest_id, "no guest online, notification skipped");
            return;
        };
        let online = self.registry.count_role(Role::Guest);
        if online > 1 || guest.user_id.as_str() != guest_id {
            warn!(
                guest_id,
                notified = %guest.user_id,
                guests_online = online,
                "decision sent to an ambiguous correspondent"
            );
        }
        let _ = guest.send(frame);
    }

    /// Forget `conn`. A connection that was already displaced leaves its
    /// replacement registered.
    pub fn close(&self, conn: &Connection) {
        if self.registry.remove(conn.user_id.as_str(), &conn.id) {
            info!(user_id = %conn.user_id, conn_id = %conn.id, "connection closed");
        } else {
            debug!(user_id = %conn.user_id, conn_id = %conn.id, "closed connection was not registered");
        }
    }
}

/// The frame a live host receives for a message that could have been queued.
fn live_frame(message: MailboxMessage) -> Outbound {
    Outbound::Message {
        from: message.from,
        guest_id: message.guest_id,
        content: message.content,
        time: message.time,
    }
}
