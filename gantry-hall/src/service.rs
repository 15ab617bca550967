use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use gantry_core::{GantryError, Result, Service};
use gantry_net::{
    parse_session_data, Frame, FrameWriter, HallApi, HallListener, HallStatus, Health, Info,
    SessionChannel,
};
use gantry_registry::Registry;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HallConfig {
    pub listen_addr: String,
    pub build_time: i64,
    pub app_version: String,
}

/// Application hook: answers each client message of a served user.
#[async_trait]
pub trait HallHandler: Send + Sync + 'static {
    async fn on_client_message(&self, member_id: &str, req_id: u64, data: Bytes) -> Result<Bytes>;
}

/// Default handler: acknowledge everything.
pub struct EchoHandler;

#[async_trait]
impl HallHandler for EchoHandler {
    async fn on_client_message(&self, _member_id: &str, _req_id: u64, _data: Bytes) -> Result<Bytes> {
        Ok(Bytes::from_static(b"OK"))
    }
}

struct SessionHandle {
    session_id: u64,
    writer: Arc<AsyncMutex<FrameWriter>>,
    token: CancellationToken,
}

struct HallCore {
    registry: Arc<Registry>,
    config: HallConfig,
    handler: Arc<dyn HallHandler>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    token: OnceLock<CancellationToken>,
}

pub struct HallService {
    inner: Arc<HallCore>,
    listener: AsyncMutex<Option<HallListener>>,
    bound_addr: OnceLock<std::net::SocketAddr>,
}

impl HallService {
    #[must_use]
    pub fn new(registry: Arc<Registry>, config: HallConfig, handler: Arc<dyn HallHandler>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(HallCore {
                registry,
                config,
                handler,
                sessions: Mutex::new(HashMap::new()),
                token: OnceLock::new(),
            }),
            listener: AsyncMutex::new(None),
            bound_addr: OnceLock::new(),
        })
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    /// The address the listener actually bound, available after `on_start`.
    #[must_use]
    pub fn bound_addr(&self) -> Option<std::net::SocketAddr> {
        self.bound_addr.get().copied()
    }
}

#[async_trait]
impl Service for HallService {
    async fn on_start(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = HallListener::bind(&self.inner.config.listen_addr).await?;
        info!(
            target: "gantry::hall",
            addr = %listener.local_addr()?,
            build_time = self.inner.config.build_time,
            "hall service starting"
        );
        let _ = self.bound_addr.set(listener.local_addr()?);
        *self.listener.lock().await = Some(listener);
        let _ = self.inner.token.set(shutdown);
        Ok(())
    }

    async fn serve(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(GantryError::NullPointer("hall listener"))?;
        let token = self
            .inner
            .token
            .get()
            .ok_or(GantryError::NullPointer("hall token"))?
            .clone();
        HallListener::serve(listener, self.inner.clone(), token).await
    }

    async fn on_stop(&self) {
        info!(target: "gantry::hall", "hall service stopped");
    }
}

#[async_trait]
impl HallApi for HallCore {
    async fn info(&self) -> Info {
        Info {
            build_time: self.config.build_time,
            app_version: self.config.app_version.clone(),
        }
    }

    async fn health(&self) -> Health {
        Health {
            status: HallStatus::Ok,
            player_count: lock(&self.sessions).len() as i64,
        }
    }

    async fn on_session(&self, session: SessionChannel) {
        let member_id = session.member_id.clone();
        let session_id = session.session_id;
        let hall_token = self.token.get().cloned().unwrap_or_default();
        let session_token = hall_token.child_token();
        let mut reader = session.reader;
        let writer = Arc::new(AsyncMutex::new(session.writer));

        // First frame is the login request.
        let first = tokio::select! {
            () = session_token.cancelled() => return,
            frame = reader.read_frame() => match frame {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(target: "gantry::hall", session_id, error = %err, "session closed before login");
                    return;
                }
            },
        };

        if !self.adopt_user(&member_id, session_id, &writer, &session_token).await {
            return;
        }
        info!(target: "gantry::hall", session_id, member_id = %member_id, "session adopted");

        let mut frame = first;
        loop {
            if let Err(err) = self.answer(&member_id, &frame, &writer).await {
                warn!(target: "gantry::hall", session_id, error = %err, "session reply failed");
                break;
            }
            frame = tokio::select! {
                () = session_token.cancelled() => break,
                next = reader.read_frame() => match next {
                    Ok(next) => next,
                    Err(_) => break,
                },
            };
        }

        self.release(&member_id, session_id).await;
        info!(target: "gantry::hall", session_id, member_id = %member_id, "session ended");
    }
}

impl HallCore {
    /// Claim the user for this session. A user already served locally gets
    /// its old session replaced with `USER_INSTEAD`; a user owned by another
    /// peer is refused with a kick naming the holder.
    async fn adopt_user(
        &self,
        member_id: &str,
        session_id: u64,
        writer: &Arc<AsyncMutex<FrameWriter>>,
        session_token: &CancellationToken,
    ) -> bool {
        let replaced = lock(&self.sessions).remove(member_id);
        let hold_lock = if let Some(previous) = replaced {
            info!(
                target: "gantry::hall",
                member_id,
                old_session = previous.session_id,
                new_session = session_id,
                "user logged in again, replacing session"
            );
            let _ = previous
                .writer
                .lock()
                .await
                .write_frame(&Frame::hall_user_instead(
                    previous.session_id,
                    "signed in from another session",
                ))
                .await;
            previous.token.cancel();
            // The previous session still holds the registry lock for us.
            true
        } else {
            match self.registry.lock_user(member_id).await {
                Ok(_) => true,
                Err(GantryError::UserLocked { owner }) => {
                    let self_name = &self.registry.self_peer().full_name;
                    match owner {
                        // A lock left behind by our own recovery record.
                        Some(peer) if &peer.full_name == self_name => true,
                        Some(peer) => {
                            warn!(
                                target: "gantry::hall",
                                member_id,
                                holder = %peer.full_name,
                                "user is served elsewhere"
                            );
                            let _ = writer
                                .lock()
                                .await
                                .write_frame(&Frame::hall_kick(
                                    session_id,
                                    &format!("user is served by {}", peer.full_name),
                                ))
                                .await;
                            return false;
                        }
                        None => {
                            let _ = writer
                                .lock()
                                .await
                                .write_frame(&Frame::hall_kick(session_id, "user is locked"))
                                .await;
                            return false;
                        }
                    }
                }
                Err(err) => {
                    warn!(target: "gantry::hall", member_id, error = %err, "user lock failed");
                    let _ = writer
                        .lock()
                        .await
                        .write_frame(&Frame::hall_kick(session_id, "login failed"))
                        .await;
                    return false;
                }
            }
        };
        if hold_lock {
            lock(&self.sessions).insert(
                member_id.to_string(),
                SessionHandle {
                    session_id,
                    writer: writer.clone(),
                    token: session_token.clone(),
                },
            );
        }
        hold_lock
    }

    async fn answer(
        &self,
        member_id: &str,
        frame: &Frame,
        writer: &Arc<AsyncMutex<FrameWriter>>,
    ) -> Result<()> {
        let (frame_member, data) = parse_session_data(frame)?;
        if frame_member != member_id {
            return Err(GantryError::Protocol(format!(
                "frame member {frame_member} does not match session member {member_id}"
            )));
        }
        let reply = self
            .handler
            .on_client_message(member_id, frame.req_id, data)
            .await?;
        writer
            .lock()
            .await
            .write_frame(&Frame::hall_data(frame.session_id, frame.req_id, "", &reply))
            .await
    }

    /// Drop the session and its lock, unless a newer session for the same
    /// user has taken over.
    async fn release(&self, member_id: &str, session_id: u64) {
        let owned = {
            let mut sessions = lock(&self.sessions);
            let ours = sessions
                .get(member_id)
                .is_some_and(|handle| handle.session_id == session_id);
            if ours {
                sessions.remove(member_id);
            }
            ours
        };
        if !owned {
            return;
        }
        if let Err(err) = self.registry.unlock_user(member_id).await {
            warn!(target: "gantry::hall", member_id, error = %err, "unlock on session end failed");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
