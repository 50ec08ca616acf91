use std::io::{ErrorKind, Read};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::constants::{ACK_BYTE, MAX_FRAME_LEN};
use crate::error::{Result, SingleError};
use crate::naming::socket_path;
use crate::protocol::{encode_handshake, encode_header, ConnectionType, Handshake};
use crate::random_sleep;
use crate::unix::{connect_unix, send_all};

/// Подключение secondary к слушателю primary.
pub struct LocalConnector {
    server_name: String,
    path: PathBuf,
    instance_number: u32,
    stream: Option<UnixStream>,
}

impl LocalConnector {
    pub fn new(server_name: &str, instance_number: u32) -> Self {
        Self {
            server_name: server_name.to_owned(),
            path: socket_path(server_name),
            instance_number,
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn instance_number(&self) -> u32 {
        self.instance_number
    }

    /// Подключение со случайной паузой перед каждой попыткой и handshake.
    ///
    /// Уже подключённый коннектор сразу возвращает `Ok`. Весь бюджет
    /// `timeout` делится между попытками подключения и подтверждением кадров.
    pub fn connect(&mut self, timeout: Duration, connection_type: ConnectionType) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let started = Instant::now();
        let mut attempts = 0u32;
        let stream = loop {
            random_sleep();
            attempts += 1;
            let budget = timeout.saturating_sub(started.elapsed());
            match connect_unix(&self.path, budget) {
                Ok(stream) => break stream,
                Err(err) => trace!(%err, attempts, "connect attempt failed"),
            }
            if started.elapsed() >= timeout {
                debug!(
                    path = %self.path.display(),
                    attempts, "primary unreachable within timeout"
                );
                return Err(SingleError::Timeout);
            }
        };

        let body = encode_handshake(&Handshake {
            server_name: self.server_name.clone(),
            connection_type,
            instance_id: self.instance_number,
        });
        let budget = remaining(started, timeout)?;
        write_confirmed_message(&stream, budget, &body).map_err(|err| match err {
            SingleError::NotConnected => SingleError::HandshakeRejected,
            other => other,
        })?;

        debug!(
            instance_id = self.instance_number,
            ?connection_type,
            "connected to primary"
        );
        self.stream = Some(stream);
        Ok(())
    }

    /// Отправка полезной нагрузки по открытому соединению.
    pub fn send_message(&mut self, payload: &[u8], timeout: Duration) -> Result<()> {
        if payload.len() as u64 > MAX_FRAME_LEN {
            return Err(SingleError::MessageTooLarge);
        }
        let stream = self.stream.as_ref().ok_or(SingleError::NotConnected)?;
        let result = write_confirmed_message(stream, timeout, payload);
        if result.is_err() {
            // после сбоя граница кадров потеряна
            self.stream = None;
        }
        result
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
    }
}

fn remaining(started: Instant, timeout: Duration) -> Result<Duration> {
    timeout
        .checked_sub(started.elapsed())
        .filter(|left| !left.is_zero())
        .ok_or(SingleError::Timeout)
}

/// Заголовок и тело, каждый кадр ждёт своего подтверждения.
fn write_confirmed_message(stream: &UnixStream, timeout: Duration, body: &[u8]) -> Result<()> {
    let started = Instant::now();
    write_confirmed_frame(
        stream,
        remaining(started, timeout)?,
        &encode_header(body.len() as u64),
    )?;
    write_confirmed_frame(stream, remaining(started, timeout)?, body)
}

fn write_confirmed_frame(stream: &UnixStream, timeout: Duration, frame: &[u8]) -> Result<()> {
    stream
        .set_write_timeout(Some(timeout))
        .map_err(|err| SingleError::from_io(err, "set_write_timeout"))?;
    send_all(stream.as_raw_fd(), frame).map_err(|err| match err.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => SingleError::NotConnected,
        _ => SingleError::from_io(err, "write frame"),
    })?;

    stream
        .set_read_timeout(Some(timeout))
        .map_err(|err| SingleError::from_io(err, "set_read_timeout"))?;
    let mut ack = [0u8; 1];
    loop {
        match (&*stream).read(&mut ack) {
            Ok(0) => return Err(SingleError::NotConnected),
            Ok(_) if ack[0] == ACK_BYTE => return Ok(()),
            Ok(_) => return Err(SingleError::Corrupted),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::ConnectionReset => {
                return Err(SingleError::NotConnected)
            }
            Err(err) => return Err(SingleError::from_io(err, "await ack")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;

    use crate::protocol::decode_handshake;

    fn unique_name(tag: &str) -> String {
        use std::time::SystemTime;
        let ts = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("xsingle_client_{}_{}_{}", tag, std::process::id(), ts % 1_000_000)
    }

    fn read_frame(stream: &mut UnixStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn no_listener_times_out() {
        let mut connector = LocalConnector::new(&unique_name("absent"), 1);
        let started = Instant::now();
        let err = connector
            .connect(Duration::from_millis(60), ConnectionType::NewInstance)
            .unwrap_err();
        assert_eq!(err, SingleError::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert!(!connector.is_connected());
    }

    #[test]
    fn handshake_waits_for_each_ack() {
        use std::io::Write;

        let name = unique_name("acks");
        let path = socket_path(&name);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let server_name = name.clone();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let header = read_frame(&mut stream, 8);
            let len = u64::from_le_bytes(header.try_into().unwrap()) as usize;
            stream.write_all(&[ACK_BYTE]).unwrap();
            let body = read_frame(&mut stream, len);
            let handshake = decode_handshake(&body, &server_name).unwrap();
            stream.write_all(&[ACK_BYTE]).unwrap();
            handshake
        });

        let mut connector = LocalConnector::new(&name, 7);
        connector
            .connect(Duration::from_secs(2), ConnectionType::SecondaryInstance)
            .unwrap();
        let handshake = server.join().unwrap();
        assert_eq!(handshake.instance_id, 7);
        assert_eq!(handshake.connection_type, ConnectionType::SecondaryInstance);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn full_backlog_respects_timeout() {
        use std::sync::mpsc;

        let name = unique_name("backlog");
        let path = socket_path(&name);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        // очередь на одно соединение, которое никто не примет
        assert_eq!(unsafe { libc::listen(listener.as_raw_fd(), 0) }, 0);
        let parked: Vec<UnixStream> = (0..4)
            .filter_map(|_| connect_unix(&path, Duration::from_millis(10)).ok())
            .collect();

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut connector = LocalConnector::new(&name, 3);
            let res = connector.connect(Duration::from_millis(200), ConnectionType::NewInstance);
            let _ = tx.send((connector.instance_number(), res));
        });

        let (number, res) = rx
            .recv_timeout(Duration::from_secs(3))
            .expect("connect outlived its timeout");
        assert_eq!(number, 3);
        assert_eq!(res, Err(SingleError::Timeout));

        drop(parked);
        drop(listener);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn silent_peer_times_out() {
        let name = unique_name("silent");
        let path = socket_path(&name);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let mut connector = LocalConnector::new(&name, 1);
        let err = connector
            .connect(Duration::from_millis(200), ConnectionType::NewInstance)
            .unwrap_err();
        assert_eq!(err, SingleError::Timeout);
        drop(listener);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn send_requires_connection() {
        let mut connector = LocalConnector::new(&unique_name("idle"), 1);
        assert_eq!(
            connector.send_message(b"x", Duration::from_millis(10)),
            Err(SingleError::NotConnected)
        );
    }
}
