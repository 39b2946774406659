mod common;
use anyhow::{Context, Result};
use common::{init_logger, pattern, Network, CLIENT, SERVER};
use serial_test::serial;
use std::time::Duration;
use tcpcc_r::config::StackConfig;
use tcpcc_r::tcp::defs::TcpCongState;

const LINK_DELAY: Duration = Duration::from_millis(10);

#[test]
#[serial]
fn test_sack_recovers_two_holes() -> Result<()> {
    init_logger();
    let mut net = Network::new(StackConfig::default(), LINK_DELAY);
    let (client, server) = net.establish()?;
    let mss = net
        .stack(CLIENT)
        .connection(client)
        .context("No client connection.")?
        .tcb
        .mss;

    // Ten segments in one flight, the 4th and the 8th are lost.
    net.drop_once.insert((CLIENT, 3 * mss));
    net.drop_once.insert((CLIENT, 7 * mss));
    let data = pattern(10 * mss as usize);
    net.send_all(CLIENT, client, &data)?;
    let received = net.recv_exact(SERVER, server, data.len(), Duration::from_secs(10))?;
    assert_eq!(received, data);
    net.run_for(Duration::from_millis(200))?;

    let conn = net
        .stack(CLIENT)
        .connection(client)
        .context("No client connection.")?;
    // Only the holes went out again, before any timeout.
    assert_eq!(conn.tx_buffer.total_retrans(), 2 * mss as u64);
    assert_eq!(conn.tx_buffer.size(), 0);
    assert_eq!(conn.tcb.cong_state, TcpCongState::Open);
    let retransmitted: Vec<Option<u32>> = net
        .retransmissions(CLIENT)
        .iter()
        .map(|t| t.offset)
        .collect();
    assert_eq!(retransmitted, vec![Some(3 * mss), Some(7 * mss)]);
    assert!(net.drop_once.is_empty());
    Ok(())
}

#[test]
#[serial]
fn test_recovery_without_sack() -> Result<()> {
    init_logger();
    let mut config = StackConfig::default();
    config.tcp.sack = false;
    let mut net = Network::new(config, LINK_DELAY);
    let (client, server) = net.establish()?;
    let mss = net
        .stack(CLIENT)
        .connection(client)
        .context("No client connection.")?
        .tcb
        .mss;

    net.drop_once.insert((CLIENT, 2 * mss));
    let data = pattern(10 * mss as usize);
    net.send_all(CLIENT, client, &data)?;
    let received = net.recv_exact(SERVER, server, data.len(), Duration::from_secs(30))?;
    assert_eq!(received, data);

    let conn = net
        .stack(CLIENT)
        .connection(client)
        .context("No client connection.")?;
    assert!(!conn.sack_enabled);
    assert!(conn.tx_buffer.total_retrans() >= mss as u64);
    Ok(())
}

#[test]
#[serial]
fn test_lost_tail_is_recovered() -> Result<()> {
    init_logger();
    let mut net = Network::new(StackConfig::default(), LINK_DELAY);
    let (client, server) = net.establish()?;
    let mss = net
        .stack(CLIENT)
        .connection(client)
        .context("No client connection.")?
        .tcb
        .mss;

    // No segment follows the last one, so nothing reports its loss.
    net.drop_once.insert((CLIENT, 4 * mss));
    let data = pattern(5 * mss as usize);
    net.send_all(CLIENT, client, &data)?;
    let received = net.recv_exact(SERVER, server, data.len(), Duration::from_secs(10))?;
    assert_eq!(received, data);
    Ok(())
}
