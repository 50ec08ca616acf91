use std::io::{ErrorKind, Read};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::connection::{Action, ConnectionState, ServerContext};
use crate::constants::{ACK_BYTE, READ_CHUNK};
use crate::error::{Result, SingleError};
use crate::instance::InstanceHandler;
use crate::naming::socket_path;
use crate::unix::{poll_readable, send_all, AccessMode};

/// Слушатель primary: принимает соединения secondary и ведёт по каждому
/// свой автомат протокола в одном потоке-реакторе.
pub struct LocalListener {
    path: PathBuf,
    running: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl LocalListener {
    pub fn start(
        name: &str,
        access: AccessMode,
        context: ServerContext,
        handler: Arc<dyn InstanceHandler>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let path = socket_path(name);

        // сокет мог остаться от упавшего primary
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(SingleError::from_io(err, "remove stale socket")),
        }

        let listener =
            UnixListener::bind(&path).map_err(|err| SingleError::from_io(err, "bind"))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(access.file_mode()))
            .map_err(|err| SingleError::from_io(err, "chmod socket"))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| SingleError::from_io(err, "set_nonblocking"))?;

        let running = Arc::new(AtomicBool::new(true));
        let worker_running = running.clone();
        let join = thread::Builder::new()
            .name(format!("xsingle-listener-{name}"))
            .spawn(move || reactor(listener, context, handler, poll_interval, worker_running))
            .map_err(|err| SingleError::from_io(err, "spawn listener"))?;

        info!(path = %path.display(), "listener started");
        Ok(Self {
            path,
            running,
            join: Mutex::new(Some(join)),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Останавливает реактор, закрывает все соединения и удаляет сокет.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let handle = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
            let _ = std::fs::remove_file(&self.path);
            debug!(path = %self.path.display(), "listener stopped");
        }
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Peer {
    stream: UnixStream,
    state: ConnectionState,
}

fn reactor(
    listener: UnixListener,
    context: ServerContext,
    handler: Arc<dyn InstanceHandler>,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
) {
    let mut peers: Vec<Peer> = Vec::new();
    let mut scratch = vec![0u8; READ_CHUNK];
    let mut actions = Vec::new();

    while running.load(Ordering::Acquire) {
        let mut fds = Vec::with_capacity(peers.len() + 1);
        fds.push(listener.as_raw_fd());
        fds.extend(peers.iter().map(|peer| peer.stream.as_raw_fd()));

        let ready = match poll_readable(&fds, poll_interval) {
            Ok(ready) => ready,
            Err(err) => {
                handler.on_error(err);
                thread::sleep(poll_interval);
                continue;
            }
        };

        // флаги готовности сдвинуты на 1 (нулевой - слушатель);
        // принятые в этом проходе соединения ждут следующего poll
        let mut index = 1;
        peers.retain_mut(|peer| {
            let readable = ready.get(index).copied().unwrap_or(false);
            index += 1;
            !readable || service(peer, &context, &handler, &mut scratch, &mut actions)
        });

        if ready[0] {
            accept_pending(&listener, &mut peers, &handler);
        }
    }

    debug!(open = peers.len(), "reactor exiting");
}

fn accept_pending(listener: &UnixListener, peers: &mut Vec<Peer>, handler: &Arc<dyn InstanceHandler>) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = stream.set_nonblocking(true) {
                    handler.on_error(SingleError::from_io(err, "set_nonblocking"));
                    continue;
                }
                peers.push(Peer {
                    stream,
                    state: ConnectionState::new(),
                });
                debug!(open = peers.len(), "connection accepted");
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                handler.on_error(SingleError::from_io(err, "accept"));
                break;
            }
        }
    }
}

/// Читает всё доступное, продвигает автомат и исполняет действия.
///
/// Возвращает `false`, если соединение нужно закрыть.
fn service(
    peer: &mut Peer,
    context: &ServerContext,
    handler: &Arc<dyn InstanceHandler>,
    scratch: &mut [u8],
    actions: &mut Vec<Action>,
) -> bool {
    let mut eof = false;
    while !peer.state.is_closed() {
        match peer.stream.read(scratch) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => peer.state.feed(&scratch[..n], context, actions),
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(%err, "read failed, dropping connection");
                eof = true;
                break;
            }
        }
    }

    if eof {
        let leftover = peer.state.finish(context, actions);
        if leftover > 0 {
            debug!(
                instance_id = peer.state.instance_id(),
                leftover, "connection closed mid-frame"
            );
        }
    }

    let mut keep = !eof;
    for action in actions.drain(..) {
        match action {
            Action::Ack => {
                if keep && send_all(peer.stream.as_raw_fd(), &[ACK_BYTE]).is_err() {
                    keep = false;
                }
            }
            Action::InstanceStarted => handler.on_instance_started(),
            Action::Message {
                instance_id,
                payload,
            } => handler.on_message(instance_id, &payload),
            Action::Close => keep = false,
        }
    }

    if !keep {
        debug!(instance_id = peer.state.instance_id(), "connection closed");
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::NoopHandler;

    fn unique_name(tag: &str) -> String {
        use std::time::SystemTime;
        let ts = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("xsingle_server_{}_{}_{}", tag, std::process::id(), ts % 1_000_000)
    }

    #[test]
    fn stop_removes_socket() {
        let name = unique_name("stop");
        let listener = LocalListener::start(
            &name,
            AccessMode::User,
            ServerContext {
                server_name: name.clone(),
                secondary_notification: false,
            },
            Arc::new(NoopHandler),
            Duration::from_millis(10),
        )
        .unwrap();

        assert_eq!(listener.path(), &socket_path(&name));
        assert!(listener.path().exists());
        assert!(listener.is_running());

        listener.stop();
        assert!(!listener.is_running());
        assert!(!listener.path().exists());
        // повторная остановка безопасна
        listener.stop();
    }
}
