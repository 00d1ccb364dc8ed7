use crate::core::DaemonEvent;
use crate::BroadcastMessage;
use scanner_proto::protocol::{Broadcast, Message, PROTOCOL_VERSION};
use scanner_proto::state::StateManager;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

/// Accept UI clients on `bind_address:port`.  Each client gets a `Hello`
/// snapshot, then a `State` after every change and after every command it
/// sends.
pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);

        let connected = Arc::new(AtomicUsize::new(0));
        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    let count = connected.fetch_add(1, Ordering::SeqCst) + 1;
                    info!("Client {} connected from {} ({} connected)", id, peer, count);

                    let sm = state_manager.clone();
                    let evt_tx = event_tx.clone();
                    let bcast_rx = broadcast_tx.subscribe();
                    let connected = connected.clone();

                    tokio::spawn(async move {
                        handle_client(stream, sm, id, evt_tx, bcast_rx).await;
                        let count = connected.fetch_sub(1, Ordering::SeqCst) - 1;
                        info!("Client {} disconnected ({} connected)", id, count);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client<S>(
    stream: S,
    state_manager: Arc<StateManager>,
    client_id: usize,
    event_tx: mpsc::Sender<DaemonEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) where
    S: AsyncRead + AsyncWrite,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    if let Ok(encoded) = encode_hello(&state_manager).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        while let Some(len) = Message::frame_len(&read_buf) {
                            let frame: Vec<u8> = read_buf.drain(..len).collect();
                            match Message::decode(&frame) {
                                Ok((Message::Command(cmd), _)) => {
                                    info!("Client {} sent command: {:?}", client_id, cmd);

                                    if event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
                                        warn!("DaemonEvent channel closed");
                                        return;
                                    }

                                    if let Ok(encoded) = encode_state(&state_manager).await {
                                        if write_half.write_all(&encoded).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    warn!("Client {} sent an unreadable frame ({} bytes): {}", client_id, len, e);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let frame = match msg {
                    Ok(BroadcastMessage::StateUpdated) => encode_state(&state_manager).await,
                    Ok(BroadcastMessage::Log(message)) => {
                        Message::Broadcast(Broadcast::Log { message }).encode()
                    }
                    Ok(BroadcastMessage::Error(message)) => {
                        Message::Broadcast(Broadcast::Error { message }).encode()
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        encode_state(&state_manager).await
                    }
                    Err(_) => break,
                };
                if let Ok(encoded) = frame {
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn encode_hello(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    let rev = state.rev;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        daemon_rev: rev,
        state,
    })
    .encode()
}

async fn encode_state(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    Message::Broadcast(Broadcast::State { data: state }).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanner_proto::protocol::Command;

    async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Message {
        let mut len = [0u8; 4];
        reader.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        reader.read_exact(&mut body).await.unwrap();
        let mut frame = len.to_vec();
        frame.extend_from_slice(&body);
        Message::decode(&frame).unwrap().0
    }

    #[tokio::test]
    async fn test_client_gets_hello_then_forwards_commands() {
        let state_manager = Arc::new(StateManager::new(Vec::new(), vec!["zen".into()]));
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (broadcast_tx, _) = broadcast::channel(8);
        let (client, server) = tokio::io::duplex(4096);
        let bcast_rx = broadcast_tx.subscribe();
        tokio::spawn(handle_client(server, state_manager, 1, event_tx, bcast_rx));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        match read_message(&mut client_read).await {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                state,
                ..
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(state.modes, vec!["zen".to_string()]);
            }
            other => panic!("expected hello, got {:?}", other),
        }

        // A command split across two writes still arrives whole.
        let frame = Message::Command(Command::SelectFeed { index: 3 })
            .encode()
            .unwrap();
        client_write.write_all(&frame[..3]).await.unwrap();
        client_write.write_all(&frame[3..]).await.unwrap();
        match event_rx.recv().await {
            Some(DaemonEvent::ClientCommand(Command::SelectFeed { index })) => {
                assert_eq!(index, 3)
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert!(matches!(
            read_message(&mut client_read).await,
            Message::Broadcast(Broadcast::State { .. })
        ));

        broadcast_tx
            .send(BroadcastMessage::Error("no feed at index 3".into()))
            .unwrap();
        match read_message(&mut client_read).await {
            Message::Broadcast(Broadcast::Error { message }) => {
                assert_eq!(message, "no feed at index 3")
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreadable_frame_is_skipped() {
        let state_manager = Arc::new(StateManager::new(Vec::new(), Vec::new()));
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (broadcast_tx, _) = broadcast::channel(8);
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(handle_client(
            server,
            state_manager,
            1,
            event_tx,
            broadcast_tx.subscribe(),
        ));
        let (mut client_read, mut client_write) = tokio::io::split(client);
        read_message(&mut client_read).await; // hello

        let junk = br#"{"cmd":"Nope"}"#;
        let mut bytes = (junk.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(junk);
        bytes.extend(Message::Command(Command::TogglePlayback).encode().unwrap());
        client_write.write_all(&bytes).await.unwrap();

        let forwarded = tokio::time::timeout(std::time::Duration::from_secs(1), event_rx.recv())
            .await
            .expect("command after bad frame was not forwarded");
        assert!(matches!(
            forwarded,
            Some(DaemonEvent::ClientCommand(Command::TogglePlayback))
        ));
    }

    #[tokio::test]
    async fn test_get_state_is_answered_with_snapshot() {
        let state_manager = Arc::new(StateManager::new(Vec::new(), vec!["zen".into()]));
        let (event_tx, _event_rx) = mpsc::channel(8);
        let (broadcast_tx, _) = broadcast::channel(8);
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(handle_client(
            server,
            state_manager,
            1,
            event_tx,
            broadcast_tx.subscribe(),
        ));
        let (mut client_read, mut client_write) = tokio::io::split(client);
        read_message(&mut client_read).await; // hello

        let frame = Message::Command(Command::GetState).encode().unwrap();
        client_write.write_all(&frame).await.unwrap();
        match read_message(&mut client_read).await {
            Message::Broadcast(Broadcast::State { data }) => {
                assert_eq!(data.modes, vec!["zen".to_string()])
            }
            other => panic!("expected state, got {:?}", other),
        }
    }
}
