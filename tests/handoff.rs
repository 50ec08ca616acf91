//! Тесты передачи данных от secondary к primary

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use xsingle::protocol::{encode_handshake, encode_header, ConnectionType, Handshake};
use xsingle::{
    socket_path, AccessMode, InstanceHandler, InstanceOptions, NoopHandler, SingleError,
    SingleInstance, ACK_BYTE,
};

fn unique_name(tag: &str) -> String {
    use std::time::SystemTime;
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("XSINGLE_HANDOFF_{}_{}_{}", tag, std::process::id(), ts % 1_000_000)
}

fn options() -> InstanceOptions {
    InstanceOptions {
        access: Some(AccessMode::User),
        ..InstanceOptions::default()
    }
}

/// Handler для тестов primary
struct TestPrimaryHandler {
    started: AtomicU32,
    messages: Mutex<Vec<(u32, Vec<u8>)>>,
}

impl TestPrimaryHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicU32::new(0),
            messages: Mutex::new(Vec::new()),
        })
    }

    fn wait_for_started(&self, count: u32, timeout: Duration) -> bool {
        let start = Instant::now();
        while self.started.load(Ordering::Acquire) < count {
            if start.elapsed() >= timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    fn wait_for_messages(&self, count: usize, timeout: Duration) -> bool {
        let start = Instant::now();
        while self.messages.lock().unwrap().len() < count {
            if start.elapsed() >= timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }
}

impl InstanceHandler for TestPrimaryHandler {
    fn on_instance_started(&self) {
        self.started.fetch_add(1, Ordering::AcqRel);
    }

    fn on_message(&self, instance_id: u32, payload: &[u8]) {
        self.messages
            .lock()
            .unwrap()
            .push((instance_id, payload.to_vec()));
    }
}

fn start_primary(name: &str, handler: Arc<TestPrimaryHandler>) -> SingleInstance {
    let primary = SingleInstance::start_named(name, "alice", handler, options()).unwrap();
    assert!(primary.is_primary());
    primary
}

/// Кадр с ожиданием подтверждения, как это делает secondary.
fn write_confirmed(stream: &mut UnixStream, frame: &[u8]) {
    stream.write_all(frame).unwrap();
    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack).unwrap();
    assert_eq!(ack[0], ACK_BYTE);
}

fn raw_connect(name: &str) -> UnixStream {
    let stream = UnixStream::connect(socket_path(name)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream
}

#[test]
fn payload_arrives_byte_identical_and_tagged() {
    let name = unique_name("payload");
    let handler = TestPrimaryHandler::new();
    let _primary = start_primary(&name, handler.clone());

    let secondary =
        SingleInstance::start_named(&name, "alice", Arc::new(NoopHandler), options()).unwrap();
    assert!(secondary.is_secondary());
    assert!(handler.wait_for_started(1, Duration::from_secs(2)));

    let payload: Vec<u8> = (0..=255u8).chain([b'\n', 0, b'\n']).collect();
    secondary.send_message(&payload).unwrap();
    secondary.send_message(b"second").unwrap();

    assert!(handler.wait_for_messages(2, Duration::from_secs(2)));
    let messages = handler.messages.lock().unwrap();
    assert_eq!(messages[0], (secondary.instance_id(), payload));
    assert_eq!(messages[1], (secondary.instance_id(), b"second".to_vec()));
}

#[test]
fn simultaneous_secondaries_both_connect() {
    let name = unique_name("pair");
    let handler = TestPrimaryHandler::new();
    let _primary = start_primary(&name, handler.clone());

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let name = name.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let opts = InstanceOptions {
                    timeout: Duration::from_millis(500),
                    ..options()
                };
                SingleInstance::start_named(&name, "alice", Arc::new(NoopHandler), opts)
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        let secondary = handle.join().unwrap().expect("secondary connect");
        ids.push(secondary.instance_id());
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);
    assert!(handler.wait_for_started(2, Duration::from_secs(2)));
}

#[test]
fn secondary_notification_is_opt_in() {
    let name = unique_name("notify");
    let handler = TestPrimaryHandler::new();
    let _primary = SingleInstance::start_named(
        &name,
        "alice",
        handler.clone(),
        InstanceOptions {
            secondary_notification: true,
            ..options()
        },
    )
    .unwrap();

    let notifying = SingleInstance::start_named(
        &name,
        "alice",
        Arc::new(NoopHandler),
        InstanceOptions {
            allow_secondary: true,
            secondary_notification: true,
            ..options()
        },
    )
    .unwrap();
    assert!(handler.wait_for_started(1, Duration::from_secs(2)));

    // без уведомления secondary не подключается вовсе
    let silent = SingleInstance::start_named(
        &name,
        "alice",
        Arc::new(NoopHandler),
        InstanceOptions {
            allow_secondary: true,
            ..options()
        },
    )
    .unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(handler.started.load(Ordering::Acquire), 1);

    // первое сообщение подключает с типом Reconnect, он не поднимает события
    silent.send_message(b"late").unwrap();
    assert!(handler.wait_for_messages(1, Duration::from_secs(2)));
    assert_eq!(handler.started.load(Ordering::Acquire), 1);
    assert_eq!(
        handler.messages.lock().unwrap()[0],
        (silent.instance_id(), b"late".to_vec())
    );
    drop(notifying);
}

#[test]
fn tampered_handshake_is_never_acknowledged() {
    let name = unique_name("tamper");
    let handler = TestPrimaryHandler::new();
    let _primary = start_primary(&name, handler.clone());

    let mut body = encode_handshake(&Handshake {
        server_name: name.clone(),
        connection_type: ConnectionType::NewInstance,
        instance_id: 9,
    });
    let last = body.len() - 1;
    body[last] ^= 0x5A;

    let mut stream = raw_connect(&name);
    write_confirmed(&mut stream, &encode_header(body.len() as u64));
    stream.write_all(&body).unwrap();

    let mut ack = [0u8; 1];
    match stream.read(&mut ack) {
        Ok(0) => {}
        Ok(_) => panic!("tampered handshake was acknowledged"),
        Err(err) => assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset),
    }

    thread::sleep(Duration::from_millis(100));
    assert_eq!(handler.started.load(Ordering::Acquire), 0);
}

#[test]
fn foreign_name_is_rejected() {
    let name = unique_name("foreign");
    let handler = TestPrimaryHandler::new();
    let _primary = start_primary(&name, handler.clone());

    let body = encode_handshake(&Handshake {
        server_name: "some-other-application".to_string(),
        connection_type: ConnectionType::NewInstance,
        instance_id: 1,
    });
    let mut stream = raw_connect(&name);
    write_confirmed(&mut stream, &encode_header(body.len() as u64));
    stream.write_all(&body).unwrap();

    let mut ack = [0u8; 1];
    assert!(!matches!(stream.read(&mut ack), Ok(1)));
    assert_eq!(handler.started.load(Ordering::Acquire), 0);
}

#[test]
fn partial_body_waits_for_remaining_bytes() {
    let name = unique_name("partial");
    let handler = TestPrimaryHandler::new();
    let _primary = start_primary(&name, handler.clone());

    let body = encode_handshake(&Handshake {
        server_name: name.clone(),
        connection_type: ConnectionType::NewInstance,
        instance_id: 42,
    });
    let mut stream = raw_connect(&name);
    write_confirmed(&mut stream, &encode_header(body.len() as u64));
    write_confirmed(&mut stream, &body);
    assert!(handler.wait_for_started(1, Duration::from_secs(2)));

    write_confirmed(&mut stream, &encode_header(5));
    stream.write_all(b"hel").unwrap();
    thread::sleep(Duration::from_millis(150));
    assert!(handler.messages.lock().unwrap().is_empty());

    write_confirmed(&mut stream, b"lo");
    assert!(handler.wait_for_messages(1, Duration::from_secs(2)));
    assert_eq!(handler.messages.lock().unwrap()[0], (42, b"hello".to_vec()));
}

#[test]
fn missing_primary_times_out() {
    let name = unique_name("stale");
    // сегмент есть, слушателя нет: имитация упавшего primary
    let primary = start_primary(&name, TestPrimaryHandler::new());
    std::fs::remove_file(socket_path(&name)).unwrap();

    let res = SingleInstance::start_named(
        &name,
        "alice",
        Arc::new(NoopHandler),
        InstanceOptions {
            timeout: Duration::from_millis(100),
            ..options()
        },
    );
    assert!(matches!(res, Err(SingleError::Timeout)));
    drop(primary);
}
