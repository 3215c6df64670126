//! Terminal negotiation against scripted clients over in-memory pipes.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use telbbs::telnet::negotiate::Negotiator;
use telbbs::telnet::TelnetStream;

const IAC: u8 = 255;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;
const TTYPE: u8 = 24;
const NAWS: u8 = 31;
const NEW_ENVIRON: u8 = 39;

#[tokio::test(start_paused = true)]
async fn cooperative_client_negotiates_everything() {
    let (server_io, mut client_io) = tokio::io::duplex(4096);

    // the client volunteers everything up front
    let client = tokio::spawn(async move {
        let mut answers = Vec::new();
        answers.extend_from_slice(&[IAC, WILL, NEW_ENVIRON]);
        answers.extend_from_slice(&[IAC, SB, NEW_ENVIRON, 0, 0]); // IS VAR
        answers.extend_from_slice(b"LANG");
        answers.push(1); // VALUE
        answers.extend_from_slice(b"en_US.UTF-8");
        answers.extend_from_slice(&[IAC, SE]);
        answers.extend_from_slice(&[IAC, WILL, TTYPE]);
        answers.extend_from_slice(&[IAC, SB, TTYPE, 0]); // IS
        answers.extend_from_slice(b"ANSI");
        answers.extend_from_slice(&[IAC, SE]);
        answers.extend_from_slice(&[IAC, WILL, NAWS]);
        answers.extend_from_slice(&[IAC, SB, NAWS, 0, 100, 0, 40, IAC, SE]);
        client_io.write_all(&answers).await.unwrap();
        // swallow whatever the server sends for the rest of the exchange
        let mut sink = [0u8; 512];
        while client_io.read(&mut sink).await.unwrap_or(0) > 0 {}
    });

    let stream = TelnetStream::new(server_io, "test:1");
    let client_side = Negotiator::new(stream).run().await.unwrap();

    assert_eq!(client_side.term(), "ansi");
    assert_eq!(client_side.env().get("LANG").unwrap(), "en_US.UTF-8");
    assert_eq!(client_side.env().get("COLUMNS").unwrap(), "100");
    assert_eq!(client_side.env().get("LINES").unwrap(), "40");
    drop(client_side);
    client.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn option_refusing_client_falls_back_to_the_cursor_trick() {
    let (server_io, mut client_io) = tokio::io::duplex(4096);

    // refuses every option but answers the vt100 cursor-position query
    let client = tokio::spawn(async move {
        const DO: u8 = 253;
        const WONT: u8 = 252;
        const DONT: u8 = 254;
        let mut seen = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = match client_io.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let chunk = &buf[..n];
            let mut replies = Vec::new();
            let mut i = 0;
            while i < chunk.len() {
                if chunk[i] == IAC && i + 2 < chunk.len() {
                    match chunk[i + 1] {
                        DO => replies.extend_from_slice(&[IAC, WONT, chunk[i + 2]]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, chunk[i + 2]]),
                        _ => {}
                    }
                    i += 3;
                } else {
                    i += 1;
                }
            }
            if !replies.is_empty() {
                client_io.write_all(&replies).await.unwrap();
            }
            seen.extend_from_slice(chunk);
            if seen.windows(4).any(|w| w == b"\x1b[6n") {
                client_io.write_all(b"\x1b[24;80R").await.unwrap();
                seen.clear();
            }
        }
    });

    let stream = TelnetStream::new(server_io, "test:2");
    let client_side = Negotiator::new(stream).run().await.unwrap();

    assert_eq!(client_side.env().get("LINES").unwrap(), "24");
    assert_eq!(client_side.env().get("COLUMNS").unwrap(), "80");
    // the matching family also identified the unknown terminal
    assert_eq!(client_side.term(), "vt100");
    drop(client_side);
    client.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn fully_unresponsive_client_defaults_to_80x24() {
    let (server_io, mut client_io) = tokio::io::duplex(4096);

    let client = tokio::spawn(async move {
        let mut sink = [0u8; 512];
        while client_io.read(&mut sink).await.unwrap_or(0) > 0 {}
    });

    let stream = TelnetStream::new(server_io, "test:3");
    let client_side = Negotiator::new(stream).run().await.unwrap();

    assert_eq!(client_side.term(), "unknown");
    assert_eq!(client_side.env().get("LINES").unwrap(), "24");
    assert_eq!(client_side.env().get("COLUMNS").unwrap(), "80");
    drop(client_side);
    client.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn client_hangup_aborts_negotiation() {
    let (server_io, client_io) = tokio::io::duplex(4096);
    drop(client_io);

    let stream = TelnetStream::new(server_io, "test:4");
    assert!(Negotiator::new(stream).run().await.is_err());
}
