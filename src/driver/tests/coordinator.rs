// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end tests of driver sessions, speaking the client protocol over an
//! in-memory stream.

use std::time::Duration;

use alchemist_driver::pool::{ChannelEvent, LocalWorkerChannel, TcpWorkerChannel, WorkerChannel};
use alchemist_driver::registry::HandleMissing;
use alchemist_driver::{Config, DriverError, serve};
use alchemist_protocol::codec::{ClientConn, CodecError};
use alchemist_protocol::command::{Command, MatrixHandle, UnknownOpcode, WorkerInfo};
use alchemist_protocol::transport::WorkerEndpoint;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

type Client = ClientConn<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

fn workers(n: u16) -> Vec<WorkerInfo> {
    (0..n)
        .map(|rank| WorkerInfo {
            hostname: format!("worker-{rank}.cluster"),
            port: 7000 + rank,
        })
        .collect()
}

fn start<C>(channel: C) -> (Client, JoinHandle<Result<(), DriverError>>)
where
    C: WorkerChannel + 'static,
{
    let (client, driver) = tokio::io::duplex(1 << 16);
    let (reader, writer) = tokio::io::split(driver);
    let session = tokio::spawn(serve(
        Config::default(),
        channel,
        ClientConn::new(reader, writer),
    ));
    let (reader, writer) = tokio::io::split(client);
    (ClientConn::new(reader, writer), session)
}

async fn handshake(client: &mut Client) -> Vec<(String, u32)> {
    client.write_u32(0xABCD).await.unwrap();
    client.write_u32(0x1).await.unwrap();
    client.flush().await.unwrap();

    assert_eq!(client.read_u32().await.unwrap(), 0xDCBA);
    assert_eq!(client.read_u32().await.unwrap(), 0x1);
    let count = client.read_u32().await.unwrap();
    let mut workers = Vec::new();
    for _ in 0..count {
        let hostname = client.read_string().await.unwrap();
        let port = client.read_u32().await.unwrap();
        workers.push((hostname, port));
    }
    workers
}

async fn send_new_matrix(client: &mut Client, num_rows: u64, num_cols: u64, layout: &[u32]) {
    client.write_u32(0x1).await.unwrap();
    client.write_u64(num_rows).await.unwrap();
    client.write_u64(num_cols).await.unwrap();
    client.write_layout(layout).await.unwrap();
    client.flush().await.unwrap();
}

/// Reads an acceptance response that carries a handle.
async fn accepted_handle(client: &mut Client) -> u32 {
    assert_eq!(client.read_u32().await.unwrap(), 0x1);
    client.read_u32().await.unwrap()
}

async fn completed(client: &mut Client) {
    assert_eq!(client.read_u32().await.unwrap(), 0x1);
}

async fn new_matrix(client: &mut Client, num_rows: u64, num_cols: u64, layout: &[u32]) -> u32 {
    send_new_matrix(client, num_rows, num_cols, layout).await;
    let handle = accepted_handle(client).await;
    completed(client).await;
    handle
}

async fn multiply(client: &mut Client, left: u32, right: u32) -> u32 {
    client.write_u32(0x2).await.unwrap();
    client.write_u32(left).await.unwrap();
    client.write_u32(right).await.unwrap();
    client.flush().await.unwrap();
    let handle = accepted_handle(client).await;
    completed(client).await;
    handle
}

async fn dims(client: &mut Client, handle: u32) -> (u64, u64) {
    client.write_u32(0x3).await.unwrap();
    client.write_u32(handle).await.unwrap();
    client.flush().await.unwrap();
    assert_eq!(client.read_u32().await.unwrap(), 0x1);
    (
        client.read_u64().await.unwrap(),
        client.read_u64().await.unwrap(),
    )
}

async fn get_rows(client: &mut Client, handle: u32, layout: &[u32]) {
    client.write_u32(0x4).await.unwrap();
    client.write_u32(handle).await.unwrap();
    client.write_layout(layout).await.unwrap();
    client.flush().await.unwrap();
    assert_eq!(client.read_u32().await.unwrap(), 0x1);
    completed(client).await;
}

async fn halt(client: &mut Client) {
    client.write_u32(0xFFFF_FFFF).await.unwrap();
    client.flush().await.unwrap();
    completed(client).await;
}

#[tokio::test]
async fn handshake_lists_workers_in_rank_order() {
    let (mut client, session) = start(LocalWorkerChannel::new(workers(3)));
    assert_eq!(
        handshake(&mut client).await,
        vec![
            ("worker-0.cluster".to_string(), 7000),
            ("worker-1.cluster".to_string(), 7001),
            ("worker-2.cluster".to_string(), 7002),
        ]
    );
    halt(&mut client).await;
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn bad_handshake_is_fatal() {
    let channel = LocalWorkerChannel::new(workers(2));
    let events = channel.events();
    let (mut client, session) = start(channel);

    client.write_u32(0xABCE).await.unwrap();
    client.write_u32(0x1).await.unwrap();
    client.flush().await.unwrap();

    let err = session.await.unwrap().unwrap_err();
    assert!(
        matches!(err, DriverError::Handshake(e) if e.actual == 0xABCE),
        "{err}"
    );
    assert!(matches!(
        client.read_u32().await,
        Err(CodecError::UnexpectedEof)
    ));
    let events = events.lock().unwrap();
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, ChannelEvent::Broadcast(_))),
        "{events:?}"
    );
    assert!(matches!(events.last(), Some(ChannelEvent::Abort(_))));
}

#[tokio::test]
async fn new_matrix_then_dims() {
    let channel = LocalWorkerChannel::new(workers(2));
    let events = channel.events();
    let (mut client, session) = start(channel);
    handshake(&mut client).await;

    let handle = new_matrix(&mut client, 100, 10, &[50, 50]).await;
    assert_eq!(handle, 42);
    assert_eq!(dims(&mut client, handle).await, (100, 10));

    halt(&mut client).await;
    session.await.unwrap().unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            ChannelEvent::WorkerInfo(0),
            ChannelEvent::WorkerInfo(1),
            ChannelEvent::Broadcast(Command::NewMatrix {
                handle: MatrixHandle(42),
                num_rows: 100,
                num_cols: 10,
                layout: vec![50, 50],
            }),
            ChannelEvent::Barrier,
            ChannelEvent::Broadcast(Command::Halt),
            ChannelEvent::Barrier,
        ]
    );
}

#[tokio::test]
async fn multiply_result_has_product_shape() {
    let (mut client, session) = start(LocalWorkerChannel::new(workers(2)));
    handshake(&mut client).await;

    let a = new_matrix(&mut client, 100, 10, &[50, 50]).await;
    let b = new_matrix(&mut client, 10, 5, &[5, 5]).await;
    let c = multiply(&mut client, a, b).await;
    assert_eq!((a, b, c), (42, 43, 44));
    assert_eq!(dims(&mut client, c).await, (100, 5));

    // Handles keep counting regardless of which request minted them.
    let d = new_matrix(&mut client, 1, 1, &[1, 0]).await;
    assert_eq!(d, 45);

    halt(&mut client).await;
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn acceptance_is_flushed_before_barrier() {
    let (channel, gate) = LocalWorkerChannel::new(workers(2)).gated();
    let events = channel.events();
    let (mut client, session) = start(channel);
    handshake(&mut client).await;

    send_new_matrix(&mut client, 8, 8, &[4, 4]).await;
    // The acceptance arrives while the barrier is still closed.
    assert_eq!(accepted_handle(&mut client).await, 42);
    assert!(
        tokio::time::timeout(Duration::from_millis(50), client.read_u32())
            .await
            .is_err(),
        "completion must wait for the barrier"
    );
    assert!(!events.lock().unwrap().contains(&ChannelEvent::Barrier));

    gate.send(()).unwrap();
    completed(&mut client).await;
    assert!(events.lock().unwrap().contains(&ChannelEvent::Barrier));

    // Halt needs the gate for the final rendezvous.
    gate.send(()).unwrap();
    halt(&mut client).await;
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn multiply_and_get_rows_complete_after_barrier() {
    let (channel, gate) = LocalWorkerChannel::new(workers(2)).gated();
    let events = channel.events();
    let (mut client, session) = start(channel);
    handshake(&mut client).await;

    for _ in 0..2 {
        gate.send(()).unwrap();
    }
    let a = new_matrix(&mut client, 6, 4, &[3, 3]).await;
    let b = new_matrix(&mut client, 4, 2, &[2, 2]).await;

    client.write_u32(0x2).await.unwrap();
    client.write_u32(a).await.unwrap();
    client.write_u32(b).await.unwrap();
    client.flush().await.unwrap();
    assert_eq!(accepted_handle(&mut client).await, 44);
    assert!(
        tokio::time::timeout(Duration::from_millis(50), client.read_u32())
            .await
            .is_err(),
        "multiply completed before the barrier"
    );
    gate.send(()).unwrap();
    completed(&mut client).await;

    client.write_u32(0x4).await.unwrap();
    client.write_u32(44).await.unwrap();
    client.write_layout(&[4, 2]).await.unwrap();
    client.flush().await.unwrap();
    assert_eq!(client.read_u32().await.unwrap(), 0x1);
    assert!(
        tokio::time::timeout(Duration::from_millis(50), client.read_u32())
            .await
            .is_err(),
        "get-rows completed before the barrier"
    );
    let barriers = |events: &[ChannelEvent]| {
        events
            .iter()
            .filter(|e| **e == ChannelEvent::Barrier)
            .count()
    };
    assert_eq!(barriers(&events.lock().unwrap()[..]), 3);
    gate.send(()).unwrap();
    completed(&mut client).await;
    assert_eq!(barriers(&events.lock().unwrap()[..]), 4);

    gate.send(()).unwrap();
    halt(&mut client).await;
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn version_mismatch_is_fatal() {
    let channel = LocalWorkerChannel::new(workers(2));
    let events = channel.events();
    let (mut client, session) = start(channel);

    client.write_u32(0xABCD).await.unwrap();
    client.write_u32(0x2).await.unwrap();
    client.flush().await.unwrap();

    let err = session.await.unwrap().unwrap_err();
    assert!(
        matches!(
            err,
            DriverError::Handshake(e) if e.field == "version" && e.expected == 0x1 && e.actual == 0x2
        ),
        "{err}"
    );
    assert!(matches!(
        client.read_u32().await,
        Err(CodecError::UnexpectedEof)
    ));
    assert!(matches!(
        events.lock().unwrap().last(),
        Some(ChannelEvent::Abort(_))
    ));
}

#[tokio::test]
async fn get_rows_of_unknown_handle_is_fatal() {
    let channel = LocalWorkerChannel::new(workers(1));
    let events = channel.events();
    let (mut client, session) = start(channel);
    handshake(&mut client).await;
    new_matrix(&mut client, 3, 3, &[3]).await;

    client.write_u32(0x4).await.unwrap();
    client.write_u32(77).await.unwrap();
    client.write_layout(&[3]).await.unwrap();
    client.flush().await.unwrap();

    let err = session.await.unwrap().unwrap_err();
    assert!(
        matches!(err, DriverError::HandleMissing(HandleMissing(MatrixHandle(77)))),
        "{err}"
    );
    assert!(matches!(
        client.read_u32().await,
        Err(CodecError::UnexpectedEof)
    ));
    let events = events.lock().unwrap();
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, ChannelEvent::Broadcast(Command::GetMatrixRows { .. }))),
        "{events:?}"
    );
    assert!(matches!(events.last(), Some(ChannelEvent::Abort(_))));
}

#[tokio::test]
async fn dims_of_unknown_handle_is_fatal() {
    let (mut client, session) = start(LocalWorkerChannel::new(workers(1)));
    handshake(&mut client).await;

    client.write_u32(0x3).await.unwrap();
    client.write_u32(42).await.unwrap();
    client.flush().await.unwrap();

    let err = session.await.unwrap().unwrap_err();
    assert!(matches!(err, DriverError::HandleMissing(_)), "{err}");
    assert!(matches!(
        client.read_u32().await,
        Err(CodecError::UnexpectedEof)
    ));
}

#[tokio::test]
async fn unknown_opcode_is_fatal_without_response() {
    let channel = LocalWorkerChannel::new(workers(2));
    let events = channel.events();
    let (mut client, session) = start(channel);
    handshake(&mut client).await;

    client.write_u32(0x99).await.unwrap();
    client.flush().await.unwrap();

    let err = session.await.unwrap().unwrap_err();
    assert!(
        matches!(err, DriverError::UnknownOpcode(UnknownOpcode(0x99))),
        "{err}"
    );
    assert!(matches!(
        client.read_u32().await,
        Err(CodecError::UnexpectedEof)
    ));
    assert_eq!(
        events.lock().unwrap().last(),
        Some(&ChannelEvent::Abort("unknown opcode: 0x99".into()))
    );
}

#[tokio::test]
async fn client_hangup_is_fatal() {
    let (mut client, session) = start(LocalWorkerChannel::new(workers(1)));
    handshake(&mut client).await;
    drop(client);

    let err = session.await.unwrap().unwrap_err();
    assert!(err.is_client_eof(), "{err}");
}

#[tokio::test]
async fn halt_responds_once_then_rendezvous() {
    let channel = LocalWorkerChannel::new(workers(2));
    let events = channel.events();
    let (mut client, session) = start(channel);
    handshake(&mut client).await;

    halt(&mut client).await;
    session.await.unwrap().unwrap();
    // Exactly one status word, then the stream ends.
    assert!(matches!(
        client.read_u32().await,
        Err(CodecError::UnexpectedEof)
    ));
    let events = events.lock().unwrap();
    assert_eq!(
        events[events.len() - 2..],
        [ChannelEvent::Broadcast(Command::Halt), ChannelEvent::Barrier]
    );
}

async fn run_worker(mut endpoint: WorkerEndpoint) -> Vec<Command> {
    let mut seen = Vec::new();
    loop {
        let cmd = endpoint.recv_command().await.unwrap();
        let halt = cmd == Command::Halt;
        seen.push(cmd);
        endpoint.barrier().await.unwrap();
        if halt {
            return seen;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tcp_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let worker_tasks: Vec<_> = workers(2)
        .into_iter()
        .zip(0u32..)
        .map(|(info, rank)| {
            tokio::spawn(async move {
                let endpoint = WorkerEndpoint::connect(addr, rank, info).await.unwrap();
                run_worker(endpoint).await
            })
        })
        .collect();

    let channel = TcpWorkerChannel::accept(&listener, 2).await.unwrap();
    let (mut client, session) = start(channel);

    assert_eq!(
        handshake(&mut client).await,
        vec![
            ("worker-0.cluster".to_string(), 7000),
            ("worker-1.cluster".to_string(), 7001),
        ]
    );
    let a = new_matrix(&mut client, 100, 10, &[50, 50]).await;
    let b = new_matrix(&mut client, 10, 5, &[5, 5]).await;
    let c = multiply(&mut client, a, b).await;
    assert_eq!(dims(&mut client, c).await, (100, 5));
    get_rows(&mut client, c, &[60, 40]).await;
    halt(&mut client).await;
    session.await.unwrap().unwrap();

    let expected = vec![
        Command::NewMatrix {
            handle: MatrixHandle(42),
            num_rows: 100,
            num_cols: 10,
            layout: vec![50, 50],
        },
        Command::NewMatrix {
            handle: MatrixHandle(43),
            num_rows: 10,
            num_cols: 5,
            layout: vec![5, 5],
        },
        Command::MatrixMultiply {
            dest: MatrixHandle(44),
            left: MatrixHandle(42),
            right: MatrixHandle(43),
        },
        Command::GetMatrixRows {
            handle: MatrixHandle(44),
            layout: vec![60, 40],
        },
        Command::Halt,
    ];
    for task in worker_tasks {
        assert_eq!(task.await.unwrap(), expected);
    }
}
