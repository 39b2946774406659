mod common;
use anyhow::Result;
use common::{init_logger, pattern, Network, CLIENT, SERVER, SERVER_ADDR, SERVER_PORT};
use serial_test::serial;
use std::net::SocketAddrV4;
use std::time::Duration;
use tcpcc_r::config::StackConfig;
use tcpcc_r::tcp::defs::{TcpError, TcpStatus};
use tcpcc_r::tcp::input::TcpEventType;
use tcpcc_r::tcp::packet::TcpFlag;
use tcpcc_r::tcp::usrreq::TcpRead;

const LINK_DELAY: Duration = Duration::from_millis(10);

#[test]
#[serial]
fn test_handshake_and_graceful_close() -> Result<()> {
    init_logger();
    let mut net = Network::new(StackConfig::default(), LINK_DELAY);
    let (client, server) = net.establish()?;
    assert_eq!(net.stack(CLIENT).status(client), Some(TcpStatus::Established));
    assert_eq!(net.stack(SERVER).status(server), Some(TcpStatus::Established));

    // Active close from the client.
    let now = net.now();
    net.stack(CLIENT).close(client, now)?;
    net.wait_event(SERVER, Duration::from_secs(5), |e| {
        e.socket_id == server && e.event == TcpEventType::PeerClosed
    })?;
    net.run_for(Duration::from_millis(100))?;
    assert_eq!(net.stack(CLIENT).status(client), Some(TcpStatus::FinWait2));
    assert_eq!(net.stack(SERVER).status(server), Some(TcpStatus::CloseWait));
    let now = net.now();
    assert_eq!(net.stack(SERVER).recv(server, 100, now)?, TcpRead::EndOfStream);

    let now = net.now();
    net.stack(SERVER).close(server, now)?;
    net.wait_event(SERVER, Duration::from_secs(5), |e| {
        e.socket_id == server && e.event == TcpEventType::Closed
    })?;
    net.wait_event(CLIENT, Duration::from_secs(5), |e| {
        e.socket_id == client && e.event == TcpEventType::Closed
    })?;
    assert_eq!(net.stack(CLIENT).status(client), Some(TcpStatus::TimeWait));
    assert_eq!(net.stack(SERVER).status(server), None);

    // 2*MSL later the client is gone too.
    net.run_for(Duration::from_secs(121))?;
    assert_eq!(net.stack(CLIENT).status(client), None);
    Ok(())
}

#[test]
#[serial]
fn test_data_exchange_both_directions() -> Result<()> {
    init_logger();
    let mut net = Network::new(StackConfig::default(), LINK_DELAY);
    let (client, server) = net.establish()?;

    let request = pattern(3000);
    net.send_all(CLIENT, client, &request)?;
    let received = net.recv_exact(SERVER, server, request.len(), Duration::from_secs(10))?;
    assert_eq!(received, request);

    let response: Vec<u8> = pattern(20000).into_iter().rev().collect();
    net.send_all(SERVER, server, &response)?;
    let received = net.recv_exact(CLIENT, client, response.len(), Duration::from_secs(10))?;
    assert_eq!(received, response);
    Ok(())
}

#[test]
#[serial]
fn test_connect_refused() -> Result<()> {
    init_logger();
    let mut net = Network::new(StackConfig::default(), LINK_DELAY);
    let now = net.now();
    let client = net.stack(CLIENT).socket();
    net.stack(CLIENT)
        .connect(client, SocketAddrV4::new(SERVER_ADDR, SERVER_PORT), now)?;
    let event = net.wait_event(CLIENT, Duration::from_secs(5), |e| {
        e.socket_id == client && matches!(e.event, TcpEventType::Error(_))
    })?;
    assert!(
        matches!(
            event.event,
            TcpEventType::Error(TcpError::ConnectionRefused { id, .. }) if id == client
        ),
        "unexpected event {:?}",
        event
    );
    assert_eq!(net.stack(CLIENT).status(client), Some(TcpStatus::Closed));
    Ok(())
}

#[test]
#[serial]
fn test_syn_retries_exhausted() -> Result<()> {
    init_logger();
    let mut config = StackConfig::default();
    config.tcp.syn_retries = 3;
    config.tcp.connection_timeout = Duration::from_secs(1);
    let mut net = Network::new(config, LINK_DELAY);
    net.blackhole[SERVER] = true;

    let now = net.now();
    let client = net.stack(CLIENT).socket();
    net.stack(CLIENT)
        .connect(client, SocketAddrV4::new(SERVER_ADDR, SERVER_PORT), now)?;
    net.wait_event(CLIENT, Duration::from_secs(60), |e| {
        e.socket_id == client && e.event == TcpEventType::ConnectionFailed
    })?;
    let syns: Vec<_> = net
        .trace
        .iter()
        .filter(|t| t.from == CLIENT && t.flags.contains(TcpFlag::SYN))
        .collect();
    assert_eq!(syns.len(), 3);
    // Exponential backoff between attempts.
    let first = syns[1].at - syns[0].at;
    let second = syns[2].at - syns[1].at;
    assert_eq!(second, first * 2);
    Ok(())
}

#[test]
#[serial]
fn test_retransmission_timeout_backs_off() -> Result<()> {
    init_logger();
    let mut net = Network::new(StackConfig::default(), LINK_DELAY);
    let (client, _server) = net.establish()?;
    net.blackhole[CLIENT] = true;

    let now = net.now();
    let mss = net.stack(CLIENT).connection(client).map_or(0, |c| c.tcb.mss) as usize;
    net.stack(CLIENT).send(client, &pattern(mss), now)?;
    let event = net.wait_event(CLIENT, Duration::from_secs(300), |e| {
        e.socket_id == client && matches!(e.event, TcpEventType::Error(_))
    })?;
    assert!(matches!(
        event.event,
        TcpEventType::Error(TcpError::TimedOut { .. })
    ));

    let sent: Vec<_> = net
        .trace
        .iter()
        .filter(|t| t.from == CLIENT && t.offset == Some(0))
        .collect();
    let retries = StackConfig::default().tcp.data_retries as usize;
    assert_eq!(sent.len(), retries + 1);
    let gaps: Vec<Duration> = sent.windows(2).map(|w| w[1].at - w[0].at).collect();
    assert_eq!(gaps[0], Duration::from_secs(1));
    for pair in gaps.windows(2) {
        assert_eq!(pair[1], pair[0] * 2);
    }
    Ok(())
}

#[test]
#[serial]
fn test_zero_window_probe() -> Result<()> {
    init_logger();
    let mut config = StackConfig::default();
    let mss = config.tcp.segment_size;
    config.tcp.rcv_buf_size = 4 * mss;
    config.tcp.persist_timeout = Duration::from_millis(500);
    let mut net = Network::new(config, LINK_DELAY);
    let (client, server) = net.establish()?;

    // The server does not read, its buffer fills up.
    let data = pattern(10 * mss as usize);
    let now = net.now();
    net.stack(CLIENT).send(client, &data, now)?;
    net.run_for(Duration::from_secs(4))?;

    let probes: Vec<_> = net
        .trace
        .iter()
        .filter(|t| t.from == CLIENT && t.len == 1)
        .collect();
    assert!(probes.len() >= 2, "probes: {:?}", probes);
    let first = probes[1].at - probes[0].at;
    assert!(probes
        .windows(2)
        .skip(1)
        .all(|w| w[1].at - w[0].at > first));

    // Reading reopens the window and the rest follows.
    let received = net.recv_exact(SERVER, server, data.len(), Duration::from_secs(30))?;
    assert_eq!(received, data);
    Ok(())
}

#[test]
#[serial]
fn test_peer_reset_after_close_with_unread_data() -> Result<()> {
    init_logger();
    let mut net = Network::new(StackConfig::default(), LINK_DELAY);
    let (client, server) = net.establish()?;
    net.send_all(CLIENT, client, &pattern(1000))?;
    net.wait_event(SERVER, Duration::from_secs(5), |e| {
        e.socket_id == server && e.event == TcpEventType::DataAvailable
    })?;

    // Closing with unread data aborts.
    let now = net.now();
    net.stack(SERVER).close(server, now)?;
    let event = net.wait_event(CLIENT, Duration::from_secs(5), |e| {
        e.socket_id == client && matches!(e.event, TcpEventType::Error(_))
    })?;
    assert!(
        matches!(
            event.event,
            TcpEventType::Error(TcpError::ConnectionReset { .. })
        ),
        "unexpected event {:?}",
        event
    );
    assert_eq!(net.stack(CLIENT).status(client), Some(TcpStatus::Closed));
    Ok(())
}
