use std::collections::VecDeque;
use std::io::{Error as IoError, ErrorKind};
use std::time::Duration;

use smol_tftpd::config::Config;
use smol_tftpd::error::{Error, Result};
use smol_tftpd::packet::{ErrorCode, Repr, DATA_SIZE};
use smol_tftpd::socket::Endpoint;
use smol_tftpd::storage::{MemStore, Storage};
use smol_tftpd::transfer::{handle_read, handle_write, Request, Transfer};
use smoltcp::wire::{IpAddress, IpEndpoint};

/// What the next receive on a [`ScriptedEndpoint`] yields.
enum Step {
    Datagram(IpEndpoint, Vec<u8>),
    Timeout,
    Fail,
}

/// Replays a fixed sequence of receives and records every send. An empty
/// script times out forever.
#[derive(Default)]
struct ScriptedEndpoint {
    script: VecDeque<Step>,
    sent: Vec<(IpEndpoint, Vec<u8>)>,
}

impl ScriptedEndpoint {
    fn new() -> Self {
        Self::default()
    }

    fn recv(mut self, from: IpEndpoint, repr: Repr<'_>) -> Self {
        self.script.push_back(Step::Datagram(from, repr.encode()));
        self
    }

    fn recv_raw(mut self, from: IpEndpoint, bytes: &[u8]) -> Self {
        self.script.push_back(Step::Datagram(from, bytes.to_vec()));
        self
    }

    fn timeout(mut self) -> Self {
        self.script.push_back(Step::Timeout);
        self
    }

    fn fail(mut self) -> Self {
        self.script.push_back(Step::Fail);
        self
    }

    /// Every packet sent, decoded, with its destination.
    fn sent(&self) -> Vec<(IpEndpoint, Repr<'_>)> {
        self.sent
            .iter()
            .map(|(to, bytes)| (*to, Repr::decode(bytes).unwrap()))
            .collect()
    }
}

impl Endpoint for ScriptedEndpoint {
    fn local_endpoint(&self) -> IpEndpoint {
        IpEndpoint::new(IpAddress::v4(10, 0, 0, 1), 40000)
    }

    fn send_to(&mut self, buf: &[u8], remote: IpEndpoint) -> Result<()> {
        self.sent.push((remote, buf.to_vec()));
        Ok(())
    }

    fn recv_from(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<(usize, IpEndpoint)> {
        match self.script.pop_front() {
            Some(Step::Datagram(from, bytes)) => {
                let copied = bytes.len().min(buf.len());
                buf[..copied].copy_from_slice(&bytes[..copied]);
                Ok((bytes.len(), from))
            }
            Some(Step::Timeout) | None => Err(Error::Timeout),
            Some(Step::Fail) => Err(Error::Io(IoError::new(
                ErrorKind::ConnectionReset,
                "connection reset",
            ))),
        }
    }
}

/// Fails every put.
struct ReadOnlyStore;

impl Storage for ReadOnlyStore {
    fn put(&self, _name: &str, _data: &[u8]) -> Result<()> {
        Err(Error::AccessViolation)
    }

    fn get(&self, _name: &str) -> Result<Vec<u8>> {
        Err(Error::NotFound)
    }
}

fn client() -> IpEndpoint {
    IpEndpoint::new(IpAddress::v4(10, 0, 0, 2), 50000)
}

fn stranger() -> IpEndpoint {
    IpEndpoint::new(IpAddress::v4(10, 0, 0, 3), 50000)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn ack(block: u16) -> Repr<'static> {
    Repr::Ack { block }
}

fn read(file: &str) -> Request {
    Request::new(file, "octet")
}

fn error_code(repr: &Repr<'_>) -> ErrorCode {
    match repr {
        Repr::Error { code, .. } => *code,
        other => panic!("expected an error packet, got {other:?}"),
    }
}

#[test]
fn write_in_order() {
    let store = MemStore::new();
    let first = pattern(DATA_SIZE);
    let last = pattern(100);
    let mut endpoint = ScriptedEndpoint::new()
        .recv(client(), Repr::Data { block: 1, data: &first })
        .recv(client(), Repr::Data { block: 2, data: &last });

    handle_write(&mut endpoint, client(), &read("up.bin"), &store, &Config::default());

    let sent = endpoint.sent();
    assert_eq!(sent, [(client(), ack(0)), (client(), ack(1)), (client(), ack(2))]);
    assert_eq!(store.get("up.bin").unwrap(), [first, last].concat());
}

#[test]
fn write_empty_file() {
    let store = MemStore::new();
    let mut endpoint = ScriptedEndpoint::new().recv(client(), Repr::Data { block: 1, data: &[] });

    handle_write(&mut endpoint, client(), &read("empty"), &store, &Config::default());

    assert_eq!(endpoint.sent(), [(client(), ack(0)), (client(), ack(1))]);
    assert_eq!(store.get("empty").unwrap(), b"");
}

#[test]
fn write_out_of_order_block_resends_last_ack() {
    let store = MemStore::new();
    let one = pattern(DATA_SIZE);
    let three = vec![3; DATA_SIZE];
    let two = vec![2; 10];
    let mut endpoint = ScriptedEndpoint::new()
        .recv(client(), Repr::Data { block: 1, data: &one })
        .recv(client(), Repr::Data { block: 3, data: &three })
        .recv(client(), Repr::Data { block: 2, data: &two });

    handle_write(&mut endpoint, client(), &read("ooo"), &store, &Config::default());

    let acks: Vec<_> = endpoint.sent().into_iter().map(|(_, repr)| repr).collect();
    assert_eq!(acks, [ack(0), ack(1), ack(1), ack(2)]);
    assert_eq!(store.get("ooo").unwrap(), [one, two].concat());
}

#[test]
fn write_duplicate_block_is_not_appended() {
    let store = MemStore::new();
    let one = pattern(DATA_SIZE);
    let mut endpoint = ScriptedEndpoint::new()
        .recv(client(), Repr::Data { block: 1, data: &one })
        .recv(client(), Repr::Data { block: 1, data: &one })
        .recv(client(), Repr::Data { block: 2, data: b"end" });

    handle_write(&mut endpoint, client(), &read("dup"), &store, &Config::default());

    assert_eq!(store.get("dup").unwrap(), [&one[..], &b"end"[..]].concat());
}

#[test]
fn write_short_unexpected_block_still_ends_transfer() {
    let store = MemStore::new();
    let mut endpoint = ScriptedEndpoint::new().recv(client(), Repr::Data { block: 7, data: b"x" });

    handle_write(&mut endpoint, client(), &read("odd"), &store, &Config::default());

    assert_eq!(endpoint.sent(), [(client(), ack(0)), (client(), ack(0))]);
    assert_eq!(store.get("odd").unwrap(), b"");
}

#[test]
fn write_aborted_by_client() {
    let store = MemStore::new();
    let mut endpoint = ScriptedEndpoint::new().recv(
        client(),
        Repr::Error {
            code: ErrorCode::DiskFull,
            msg: "nope",
        },
    );

    handle_write(&mut endpoint, client(), &read("gone"), &store, &Config::default());

    assert_eq!(endpoint.sent(), [(client(), ack(0))]);
    assert!(matches!(store.get("gone"), Err(Error::NotFound)));
}

#[test]
fn write_unexpected_packet() {
    let store = MemStore::new();
    let mut endpoint = ScriptedEndpoint::new().recv(client(), ack(0));

    handle_write(&mut endpoint, client(), &read("f"), &store, &Config::default());

    let sent = endpoint.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(error_code(&sent[1].1), ErrorCode::NotDefined);
    assert!(matches!(store.get("f"), Err(Error::NotFound)));
}

#[test]
fn write_malformed_packet() {
    let store = MemStore::new();
    let mut endpoint = ScriptedEndpoint::new().recv_raw(client(), &[0, 3, 0]);

    handle_write(&mut endpoint, client(), &read("f"), &store, &Config::default());

    let sent = endpoint.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(error_code(&sent[1].1), ErrorCode::NotDefined);
}

#[test]
fn write_put_failure_skips_final_ack() {
    let mut endpoint = ScriptedEndpoint::new().recv(client(), Repr::Data { block: 1, data: b"hi" });

    handle_write(&mut endpoint, client(), &read("ro"), &ReadOnlyStore, &Config::default());

    let sent = endpoint.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1, ack(0));
    assert_eq!(
        sent[1].1,
        Repr::Error {
            code: ErrorCode::NotDefined,
            msg: "unable to put file"
        }
    );
}

#[test]
fn read_single_full_block() {
    let store = MemStore::new();
    let file = pattern(DATA_SIZE);
    store.put("one", &file).unwrap();
    let mut endpoint = ScriptedEndpoint::new().recv(client(), ack(1));

    handle_read(&mut endpoint, client(), &read("one"), &store, &Config::default());

    assert_eq!(endpoint.sent(), [(client(), Repr::Data { block: 1, data: &file })]);
}

#[test]
fn read_two_full_blocks() {
    let store = MemStore::new();
    let file = pattern(2 * DATA_SIZE);
    store.put("two", &file).unwrap();
    let mut endpoint = ScriptedEndpoint::new().recv(client(), ack(1)).recv(client(), ack(2));

    handle_read(&mut endpoint, client(), &read("two"), &store, &Config::default());

    assert_eq!(
        endpoint.sent(),
        [
            (client(), Repr::Data { block: 1, data: &file[..DATA_SIZE] }),
            (client(), Repr::Data { block: 2, data: &file[DATA_SIZE..] }),
        ]
    );
}

#[test]
fn read_partial_last_block() {
    let store = MemStore::new();
    let file = pattern(DATA_SIZE + 1);
    store.put("f", &file).unwrap();
    let mut endpoint = ScriptedEndpoint::new().recv(client(), ack(1)).recv(client(), ack(2));

    handle_read(&mut endpoint, client(), &read("f"), &store, &Config::default());

    let sent = endpoint.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].1, Repr::Data { block: 2, data: &file[DATA_SIZE..] });
}

#[test]
fn read_empty_file_sends_nothing() {
    let store = MemStore::new();
    store.put("empty", b"").unwrap();
    let mut endpoint = ScriptedEndpoint::new();

    handle_read(&mut endpoint, client(), &read("empty"), &store, &Config::default());

    assert!(endpoint.sent.is_empty());
}

#[test]
fn read_missing_file() {
    let store = MemStore::new();
    let mut endpoint = ScriptedEndpoint::new();

    handle_read(&mut endpoint, client(), &read("missing"), &store, &Config::default());

    assert_eq!(
        endpoint.sent(),
        [(
            client(),
            Repr::Error {
                code: ErrorCode::FileNotFound,
                msg: "file does not exist"
            }
        )]
    );
}

#[test]
fn read_stale_ack_resends_block() {
    let store = MemStore::new();
    store.put("f", b"tiny").unwrap();
    let mut endpoint = ScriptedEndpoint::new().recv(client(), ack(0)).recv(client(), ack(1));

    handle_read(&mut endpoint, client(), &read("f"), &store, &Config::default());

    let data = Repr::Data { block: 1, data: b"tiny" };
    assert_eq!(endpoint.sent(), [(client(), data), (client(), data)]);
}

#[test]
fn read_aborted_by_client() {
    let store = MemStore::new();
    store.put("f", &pattern(3 * DATA_SIZE)).unwrap();
    let mut endpoint = ScriptedEndpoint::new().recv(client(), ack(1)).recv(
        client(),
        Repr::Error {
            code: ErrorCode::NotDefined,
            msg: "cancelled",
        },
    );

    handle_read(&mut endpoint, client(), &read("f"), &store, &Config::default());

    assert_eq!(endpoint.sent().len(), 2);
}

#[test]
fn read_unexpected_packet() {
    let store = MemStore::new();
    store.put("f", b"tiny").unwrap();
    let mut endpoint = ScriptedEndpoint::new().recv(client(), Repr::Data { block: 1, data: b"?" });

    handle_read(&mut endpoint, client(), &read("f"), &store, &Config::default());

    let sent = endpoint.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(error_code(&sent[1].1), ErrorCode::NotDefined);
}

#[test]
fn timeout_after_five_attempts() {
    let store = MemStore::new();
    let mut endpoint = ScriptedEndpoint::new();

    handle_write(&mut endpoint, client(), &read("slow"), &store, &Config::default());

    let sent = endpoint.sent();
    assert_eq!(sent.len(), 6);
    assert!(sent[..5].iter().all(|packet| *packet == (client(), ack(0))));
    assert_eq!(
        sent[5],
        (
            client(),
            Repr::Error {
                code: ErrorCode::NotDefined,
                msg: "connection timed out"
            }
        )
    );
    assert!(matches!(store.get("slow"), Err(Error::NotFound)));
}

#[test]
fn timeouts_below_the_limit_are_retried() {
    let store = MemStore::new();
    store.put("f", b"tiny").unwrap();
    let mut endpoint = ScriptedEndpoint::new()
        .timeout()
        .timeout()
        .timeout()
        .timeout()
        .recv(client(), ack(1));

    handle_read(&mut endpoint, client(), &read("f"), &store, &Config::default());

    let sent = endpoint.sent();
    assert_eq!(sent.len(), 5);
    assert!(sent.iter().all(|(_, repr)| matches!(repr, Repr::Data { block: 1, .. })));
}

#[test]
fn max_attempts_is_configurable() {
    let config = Config {
        max_attempts: 2,
        ..Config::default()
    };
    let mut endpoint = ScriptedEndpoint::new();
    let mut transfer = Transfer::new(&mut endpoint, client(), config);
    let mut rx = [0u8; 16];

    let result = transfer.transmit(&ack(0), &mut rx);

    assert!(matches!(result, Err(Error::Timeout)));
    drop(transfer);
    assert_eq!(endpoint.sent.len(), 2);
}

#[test]
fn wrong_tid_is_rejected_without_using_an_attempt() {
    let store = MemStore::new();
    store.put("f", b"tiny").unwrap();
    let mut endpoint = ScriptedEndpoint::new()
        .timeout()
        .timeout()
        .timeout()
        .timeout()
        .recv(stranger(), ack(1))
        .recv(stranger(), ack(1))
        .recv(client(), ack(1));

    handle_read(&mut endpoint, client(), &read("f"), &store, &Config::default());

    let data = Repr::Data { block: 1, data: b"tiny" };
    let unknown = Repr::Error {
        code: ErrorCode::UnknownTid,
        msg: "unknown transfer ID",
    };
    let sent = endpoint.sent();
    assert_eq!(sent.len(), 9);
    assert!(sent[..5].iter().all(|packet| *packet == (client(), data)));
    assert_eq!(sent[5], (stranger(), unknown));
    assert_eq!(sent[6], (client(), data));
    assert_eq!(sent[7], (stranger(), unknown));
    assert_eq!(sent[8], (client(), data));
}

#[test]
fn oversized_datagram_from_stranger_is_rejected() {
    let store = MemStore::new();
    let mut endpoint = ScriptedEndpoint::new()
        .recv_raw(stranger(), &[0; 600])
        .recv(client(), Repr::Data { block: 1, data: b"ok" });

    handle_write(&mut endpoint, client(), &read("f"), &store, &Config::default());

    let sent = endpoint.sent();
    assert_eq!(
        sent,
        [
            (client(), ack(0)),
            (
                stranger(),
                Repr::Error {
                    code: ErrorCode::UnknownTid,
                    msg: "unknown transfer ID"
                }
            ),
            (client(), ack(0)),
            (client(), ack(1)),
        ]
    );
    assert_eq!(store.get("f").unwrap(), b"ok");
}

#[test]
fn oversized_reply_from_client_aborts() {
    let store = MemStore::new();
    let mut endpoint = ScriptedEndpoint::new().recv_raw(client(), &[0; 600]);

    handle_write(&mut endpoint, client(), &read("f"), &store, &Config::default());

    let sent = endpoint.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(
        sent[1].1,
        Repr::Error {
            code: ErrorCode::NotDefined,
            msg: "malformed packet: 600 bytes is too long"
        }
    );
    assert!(matches!(store.get("f"), Err(Error::NotFound)));
}

#[test]
fn receive_failure_aborts_immediately() {
    let store = MemStore::new();
    store.put("f", b"tiny").unwrap();
    let mut endpoint = ScriptedEndpoint::new().fail();

    handle_read(&mut endpoint, client(), &read("f"), &store, &Config::default());

    let sent = endpoint.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(
        sent[1].1,
        Repr::Error {
            code: ErrorCode::NotDefined,
            msg: "connection reset"
        }
    );
}

#[test]
fn transmit_returns_the_reply() {
    let mut endpoint = ScriptedEndpoint::new().recv(client(), Repr::Data { block: 4, data: b"ABC" });
    let mut transfer = Transfer::new(&mut endpoint, client(), Config::default());
    let mut rx = [0u8; 64];

    let reply = transfer.transmit(&ack(3), &mut rx).unwrap();

    assert_eq!(reply, Repr::Data { block: 4, data: b"ABC" });
}
