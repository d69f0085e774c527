/// Example wiring two L2CAP managers back to back over an in-memory link
///
/// One side registers a PSM, the other connects to it in Enhanced
/// Retransmission Mode. One I-frame is lost on the way and recovered.
use l2cap_ertm::*;
use std::time::Instant;

const PSM: Psm = Psm::new(0x1001);

/// Move every queued ACL packet from `from` to `to`, skipping the ones
/// `drop` picks. Returns how many packets were delivered.
fn pump(
    from: &mut L2capManager,
    to: &mut L2capManager,
    now: Instant,
    mut drop: impl FnMut(usize) -> bool,
) -> Result<usize, L2capError> {
    let mut delivered = 0;
    let mut index = 0;
    while let Some(packet) = from.poll_transmit() {
        if drop(index) {
            println!("  (lost packet of {} bytes)", packet.payload.len());
        } else {
            to.handle_acl(&packet.to_bytes(), now)?;
            delivered += 1;
        }
        index += 1;
    }
    Ok(delivered)
}

fn settle(
    client: &mut L2capManager,
    server: &mut L2capManager,
    now: Instant,
) -> Result<(), L2capError> {
    loop {
        let moved = pump(client, server, now, |_| false)? + pump(server, client, now, |_| false)?;
        if moved == 0 {
            return Ok(());
        }
    }
}

fn print_events(name: &str, manager: &mut L2capManager) {
    while let Some(event) = manager.poll_event() {
        match event {
            ChannelEvent::Connected { cid, psm, params } => println!(
                "{}: channel 0x{:04x} to {} open in {} mode, MTU {}",
                name, cid, psm, params.mode, params.remote_mtu
            ),
            ChannelEvent::Data { cid, data } => println!(
                "{}: received {:?} on 0x{:04x}",
                name,
                String::from_utf8_lossy(&data),
                cid
            ),
            ChannelEvent::Disconnected { cid, reason } => {
                println!("{}: channel 0x{:04x} closed ({})", name, cid, reason)
            }
            other => println!("{}: {:?}", name, other),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("L2CAP ERTM Loopback Example");
    println!("---------------------------");

    let now = Instant::now();
    let mut client = L2capManager::new(L2capConfig::default());
    let mut server = L2capManager::new(L2capConfig::default());

    server.register_psm(PSM, ChannelConfig::ertm_mandatory())?;
    let cid = client.connect(PSM, ChannelConfig::ertm_mandatory())?;
    println!("Connecting on local CID 0x{:04x}", cid);

    settle(&mut client, &mut server, now)?;
    print_events("client", &mut client);
    print_events("server", &mut server);

    println!("Sending three SDUs, the second I-frame is lost");
    for text in ["first", "second", "third"] {
        client.send(cid, text.as_bytes(), now)?;
    }
    pump(&mut client, &mut server, now, |index| index == 1)?;
    settle(&mut client, &mut server, now)?;
    print_events("server", &mut server);

    if let Some(engine) = client.channel(cid).and_then(|c| c.ertm()) {
        println!("Client has {} unacknowledged I-frames", engine.unacked_frames());
    }

    println!("Closing channel");
    client.close(cid)?;
    settle(&mut client, &mut server, now)?;
    print_events("client", &mut client);
    print_events("server", &mut server);

    Ok(())
}
