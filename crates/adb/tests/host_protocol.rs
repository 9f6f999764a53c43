//! Host-service protocol tests against an in-process fake ADB server.

mod support;

use std::time::Duration;

use tokio::io::AsyncWriteExt;

use adb::{AdbClient, AdbError, TransportOption};
use support::*;

#[tokio::test]
async fn query_reads_framed_response() {
    let (listener, option) = bind_server().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let service = read_service(&mut stream).await;
        assert_eq!(service, "host:devices-l");
        write_okay(&mut stream).await;
        write_framed_str(&mut stream, "HT12345 device product:sargo model:Pixel device:sargo transport_id:1\n").await;
    });

    let client = AdbClient::new(option);
    let devices = client.list_devices(true, None).await.unwrap();
    server.await.unwrap();

    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].serial, "HT12345");
    assert_eq!(devices[0].model, "Pixel");
    assert_eq!(devices[0].transport_id, 1);
}

#[tokio::test]
async fn fail_status_carries_server_message() {
    let (listener, option) = bind_server().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _service = read_service(&mut stream).await;
        write_fail(&mut stream, "device offline").await;
    });

    let client = AdbClient::new(option);
    let err = client.command("get-state", None).await.unwrap_err();
    server.await.unwrap();

    match err {
        AdbError::Protocol(msg) => assert_eq!(msg, "device offline"),
        other => panic!("expected protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn non_host_service_switches_transport() {
    let (listener, option) = bind_server().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let selector = accept_transport(&mut stream, 7).await;
        assert_eq!(selector, "host:tport:any");

        let service = read_service(&mut stream).await;
        assert_eq!(service, "echo:hello");
        write_okay(&mut stream).await;
        stream.write_all(b"raw bytes until eof").await.unwrap();
    });

    let client = AdbClient::new(option);
    let out = client.command_connect("echo:hello").await.unwrap();
    server.await.unwrap();

    assert_eq!(out, b"raw bytes until eof");
}

#[tokio::test]
async fn serial_option_selects_transport_by_serial() {
    let (listener, mut option) = bind_server().await;
    option.serial = "HT12345".into();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let selector = accept_transport(&mut stream, 3).await;
        assert_eq!(selector, "host:tport:serial:HT12345");

        let service = read_service(&mut stream).await;
        assert_eq!(service, "echo:x");
        write_okay(&mut stream).await;
    });

    let client = AdbClient::new(option);
    let out = client.command_connect("echo:x").await.unwrap();
    server.await.unwrap();
    assert!(out.is_empty());
}

#[tokio::test]
async fn command_waits_for_second_status() {
    let (listener, option) = bind_server().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let service = read_service(&mut stream).await;
        assert_eq!(service, "host:wait-for-any-device");
        write_okay(&mut stream).await; // request accepted
        write_okay(&mut stream).await; // condition reached
    });

    let client = AdbClient::new(option);
    client.wait_device("device", None).await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn command_times_out_when_status_never_arrives() {
    let (listener, option) = bind_server().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _service = read_service(&mut stream).await;
        write_okay(&mut stream).await; // accepted, then silence
        // Hold the socket open until the client gives up.
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let client = AdbClient::new(option);
    let err = client
        .command("wait-for-any-device", Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, AdbError::Timeout));
    server.await.unwrap();
}

#[tokio::test]
async fn shell_v2_accumulates_streams_and_exit_code() {
    let (listener, option) = bind_server().await;

    // One packet of exactly 40960 bytes must arrive intact.
    let big = vec![0x5a_u8; 40960];
    let expected = big.clone();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_transport(&mut stream, 1).await;

        let service = read_service(&mut stream).await;
        assert_eq!(service, "shell,v2,raw:cat /data/blob");
        write_okay(&mut stream).await;

        // stdout packet
        let mut pkt = vec![1u8];
        pkt.extend_from_slice(&(big.len() as u32).to_le_bytes());
        pkt.extend_from_slice(&big);
        stream.write_all(&pkt).await.unwrap();

        // stderr packet
        let err_payload = b"warning: partial";
        let mut pkt = vec![2u8];
        pkt.extend_from_slice(&(err_payload.len() as u32).to_le_bytes());
        pkt.extend_from_slice(err_payload);
        stream.write_all(&pkt).await.unwrap();

        // exit packet
        let pkt = [3u8, 1, 0, 0, 0, 17];
        stream.write_all(&pkt).await.unwrap();
    });

    let client = AdbClient::new(option);
    let out = client
        .execute_shell("cat /data/blob", Some(true))
        .await
        .unwrap();
    server.await.unwrap();

    assert_eq!(out.exit_code, 17);
    assert_eq!(out.stdout, expected);
    assert_eq!(out.stderr, b"warning: partial");
}

#[tokio::test]
async fn shell_v1_fallback_reads_to_eof() {
    let (listener, option) = bind_server().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_transport(&mut stream, 1).await;

        let service = read_service(&mut stream).await;
        assert_eq!(service, "shell:id");
        write_okay(&mut stream).await;
        stream.write_all(b"uid=0(root)\n").await.unwrap();
    });

    let client = AdbClient::new(option);
    let out = client.execute_shell("id", Some(false)).await.unwrap();
    server.await.unwrap();

    assert_eq!(out.exit_code, 0);
    assert_eq!(out.stdout, b"uid=0(root)\n");
    assert!(out.stderr.is_empty());
}

#[tokio::test]
async fn features_splits_comma_list() {
    let (listener, option) = bind_server().await;

    let server = tokio::spawn(async move {
        serve_features(&listener, "shell_v2,stat_v2,ls_v2").await;
    });

    let client = AdbClient::new(option);
    let features = client.features().await.unwrap();
    server.await.unwrap();

    assert_eq!(features, vec!["shell_v2", "stat_v2", "ls_v2"]);
}

#[tokio::test]
async fn unreachable_server_yields_empty_query_without_autostart() {
    let option = dead_server_option().await;
    let client = AdbClient::new(option);

    assert_eq!(client.query("host:devices-l").await.unwrap(), "");
    assert!(client.list_devices(true, None).await.unwrap().is_empty());
    assert_eq!(client.features().await.unwrap(), Vec::<String>::new());
}

#[tokio::test]
async fn unreachable_server_fails_commands() {
    let option = dead_server_option().await;
    let client = AdbClient::new(option);

    let err = client.command("get-state", None).await.unwrap_err();
    assert!(matches!(err, AdbError::Connect(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn blocking_client_round_trip() {
    let (listener, option) = bind_server().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let service = read_service(&mut stream).await;
        assert_eq!(service, "host:version");
        write_okay(&mut stream).await;
        write_framed_str(&mut stream, "0029").await;
    });

    // The blocking client owns its runtime; hand it off to a plain thread.
    let handle = std::thread::spawn(move || {
        let client = adb::blocking::AdbClient::new(option);
        client.query("host:version")
    });
    let version = handle.join().unwrap().unwrap();
    server.await.unwrap();

    assert_eq!(version, "0029");
}

#[tokio::test]
async fn oversize_service_is_rejected_before_send() {
    let (_listener, option) = bind_server().await;
    let client = AdbClient::new(option);

    let service = format!("host:{}", "x".repeat(1025));
    let err = client.query(&service).await.unwrap_err();
    assert!(matches!(err, AdbError::Protocol(_)));
}

#[tokio::test]
async fn transport_refusal_is_a_connection_error() {
    let (listener, option) = bind_server().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let selector = read_service(&mut stream).await;
        assert_eq!(selector, "host:tport:any");
        write_fail(&mut stream, "no devices/emulators found").await;
    });

    let client = AdbClient::new(option);
    let err = client.command_connect("shell:id").await.unwrap_err();
    server.await.unwrap();

    match err {
        AdbError::Connect(msg) => assert_eq!(msg, "no devices/emulators found"),
        other => panic!("expected connection error, got {other:?}"),
    }
}

#[test]
fn transport_option_defaults() {
    let option = TransportOption::default();
    assert!(option.launch_server);
    assert!(option.serial.is_empty());
    assert!(option.transport_id.is_none());
}
