use bincode::{deserialize, serialize};
use shared::{Packet, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Smoke-test client: connects to a local server, creates a lobby,
/// readies up, and prints every packet that comes back for a while.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Create local socket
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    // Server address
    let server_addr = "127.0.0.1:8080".parse::<SocketAddr>()?;

    // Connect
    let connect_packet = Packet::Connect {
        client_version: PROTOCOL_VERSION,
    };
    println!("Sending connection request to {}", server_addr);
    socket
        .send_to(&serialize(&connect_packet)?, server_addr)
        .await?;

    let mut buf = [0u8; 2048];
    let (len, _) = socket.recv_from(&mut buf).await?;
    let session_id = match deserialize::<Packet>(&buf[0..len])? {
        Packet::Connected { session_id } => {
            println!("Connected with session ID: {}", session_id);
            session_id
        }
        other => {
            println!("Expected Connected but got: {:?}", other);
            return Ok(());
        }
    };

    // Create a small lobby
    let create_packet = Packet::CreateLobby {
        capacity: 2,
        duration_minutes: 1,
        player_name: format!("Tester{}", session_id),
    };
    println!("Creating lobby: {:?}", create_packet);
    socket
        .send_to(&serialize(&create_packet)?, server_addr)
        .await?;

    let (len, _) = socket.recv_from(&mut buf).await?;
    let lobby_code = match deserialize::<Packet>(&buf[0..len])? {
        Packet::LobbyCreated { lobby } => {
            println!(
                "Lobby {} created ({:?}, capacity {}, {} min)",
                lobby.code, lobby.phase, lobby.capacity, lobby.duration_minutes
            );
            lobby.code
        }
        other => {
            println!("Expected LobbyCreated but got: {:?}", other);
            return Ok(());
        }
    };
    println!("Join from a second client with: {}", lobby_code);

    // Ready up and ask for the active-lobby listing
    socket
        .send_to(&serialize(&Packet::PlayerReady { ready: true })?, server_addr)
        .await?;
    socket
        .send_to(&serialize(&Packet::GetActiveLobbies)?, server_addr)
        .await?;

    // Print whatever the server pushes for 30 seconds
    println!("Listening for server events...");
    for _ in 0..30 {
        match timeout(Duration::from_secs(1), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => match deserialize::<Packet>(&buf[0..len]) {
                Ok(packet) => println!("Received: {:?}", packet),
                Err(e) => println!("Failed to deserialize server packet: {}", e),
            },
            Ok(Err(e)) => println!("Error receiving packet: {}", e),
            Err(_) => {}
        }
    }

    // Leave and disconnect when done
    println!("Sending leave and disconnect");
    socket
        .send_to(&serialize(&Packet::LeaveLobby)?, server_addr)
        .await?;
    socket
        .send_to(&serialize(&Packet::Disconnect)?, server_addr)
        .await?;

    println!("Test client finished");
    Ok(())
}
