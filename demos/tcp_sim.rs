use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tcpcc_r::config::{load_config, CongestionKind, StackConfig};
use tcpcc_r::fq::{FqDequeue, FqScheduler};
use tcpcc_r::sched::{EventQueue, Scheduler};
use tcpcc_r::tcp::input::TcpEventType;
use tcpcc_r::tcp::output::OutSegment;
use tcpcc_r::tcp::usrreq::{TcpRead, TcpStack};

#[derive(Parser, Debug)]
#[command(version, about = "Bulk transfer between two simulated hosts", long_about = None)]
#[command(after_help = "EXAMPLES: ./tcp_sim --cc bbr --bytes 4000000 --rate 1250000 --delay 20 --loss 0.01")]
struct Args {
    #[arg(long, short = 'c', help = "Config files, later ones override earlier ones")]
    config: Vec<PathBuf>,

    #[arg(long, value_enum, help = "Congestion control, overrides the config")]
    cc: Option<CcArg>,

    #[arg(long, help = "Bytes to transfer", default_value_t = 1_000_000)]
    bytes: usize,

    #[arg(long, help = "Bottleneck rate in bytes per second", default_value_t = 1_250_000)]
    rate: u64,

    #[arg(long, help = "One way delay in milliseconds", default_value_t = 20)]
    delay: u64,

    #[arg(long, help = "Probability of dropping a data segment", default_value_t = 0.0)]
    loss: f64,

    #[arg(long, help = "Enable pacing")]
    pacing: bool,

    #[arg(long, help = "Seed for loss and initial sequence numbers", default_value_t = 1)]
    seed: u64,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CcArg {
    Cubic,
    Bbr,
}

impl From<CcArg> for CongestionKind {
    fn from(arg: CcArg) -> Self {
        match arg {
            CcArg::Cubic => CongestionKind::Cubic,
            CcArg::Bbr => CongestionKind::Bbr,
        }
    }
}

struct Host {
    stack: TcpStack,
    qdisc: FqScheduler<OutSegment>,
    link_free_at: Instant,
    wake: Option<Instant>,
}

struct Link {
    clock: EventQueue<(usize, OutSegment)>,
    hosts: Vec<Host>,
    rate: u64,
    delay: Duration,
    loss: f64,
    rng: StdRng,
    dropped: u64,
}

impl Link {
    fn pump(&mut self) {
        let now = self.clock.now();
        for from in 0..self.hosts.len() {
            loop {
                let host = &mut self.hosts[from];
                while let Some(segment) = host.stack.poll_transmit() {
                    if let Err(drop) = host.qdisc.enqueue(segment, now) {
                        log::debug!("qdisc dropped a segment: {}", drop.reason);
                        host.stack.on_segment_dropped(&drop.item, now);
                    }
                }
                host.wake = None;
                let mut sent = false;
                while host.link_free_at <= now {
                    match host.qdisc.dequeue(now) {
                        FqDequeue::Ready(segment) => {
                            host.stack.on_segment_departed(&segment, now);
                            let serialization = Duration::from_nanos(
                                segment.wire_size() as u64 * 1_000_000_000 / self.rate,
                            );
                            host.link_free_at = now + serialization;
                            sent = true;
                            if !segment.packet.payload.is_empty() && self.rng.gen_bool(self.loss) {
                                self.dropped += 1;
                                continue;
                            }
                            self.clock.schedule_at(
                                now + serialization + self.delay,
                                (1 - from, segment),
                            );
                        }
                        FqDequeue::Throttled(at) => {
                            host.wake = Some(at);
                            break;
                        }
                        FqDequeue::Empty => break,
                    }
                }
                if !host.qdisc.is_empty() && host.wake.is_none() {
                    host.wake = Some(host.link_free_at);
                }
                if !sent {
                    break;
                }
            }
        }
    }

    fn step(&mut self) -> bool {
        self.pump();
        let timers = self
            .hosts
            .iter()
            .flat_map(|host| [host.stack.next_timeout(), host.wake])
            .flatten()
            .min();
        let next = match (timers, self.clock.peek_time()) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return false,
        };
        match self.clock.pop_until(next) {
            Some((now, (to, segment))) => {
                self.hosts[to].stack.input(
                    segment.src,
                    segment.dst,
                    &segment.packet,
                    segment.ecn,
                    now,
                );
            }
            None => {
                let now = self.clock.now();
                for host in self.hosts.iter_mut() {
                    host.stack.handle_timeout(now);
                }
            }
        }
        true
    }
}

fn main() -> Result<()> {
    env_logger::builder().format_timestamp_millis().init();
    let args = Args::parse();
    let mut config = if args.config.is_empty() {
        StackConfig::default()
    } else {
        load_config(&args.config)?
    };
    if let Some(cc) = args.cc {
        config.tcp.congestion_control = cc.into();
    }
    config.tcp.pacing |= args.pacing;
    anyhow::ensure!(args.rate > 0, "Link rate must be positive.");
    anyhow::ensure!((0.0..1.0).contains(&args.loss), "Loss must be in [0, 1).");

    let start = Instant::now();
    let client_addr = Ipv4Addr::new(172, 20, 10, 100);
    let server_addr = SocketAddrV4::new(Ipv4Addr::new(172, 20, 10, 110), 2000);
    let host = |addr, seed| Host {
        stack: TcpStack::with_seed(config.clone(), addr, seed, start),
        qdisc: FqScheduler::new(config.fq.clone()),
        link_free_at: start,
        wake: None,
    };
    let mut link = Link {
        clock: EventQueue::new(start),
        hosts: vec![host(client_addr, args.seed), host(*server_addr.ip(), args.seed + 1)],
        rate: args.rate,
        delay: Duration::from_millis(args.delay),
        loss: args.loss,
        rng: StdRng::seed_from_u64(args.seed),
        dropped: 0,
    };

    let listener = link.hosts[1].stack.socket();
    link.hosts[1].stack.bind(listener, server_addr)?;
    link.hosts[1].stack.listen(listener)?;
    let client = link.hosts[0].stack.socket();
    link.hosts[0].stack.connect(client, server_addr, start)?;

    let data: Vec<u8> = (0..args.bytes).map(|i| (i % 251) as u8).collect();
    let mut server = None;
    let mut sent = 0;
    let mut received: Vec<u8> = Vec::with_capacity(args.bytes);
    let mut connected = false;
    while received.len() < data.len() {
        while let Some(event) = link.hosts[0].stack.poll_event() {
            match event.event {
                TcpEventType::Connected => connected = true,
                TcpEventType::Error(e) => return Err(e).context("Client failed."),
                TcpEventType::ConnectionFailed => anyhow::bail!("Connection failed."),
                _ => {}
            }
        }
        while link.hosts[1].stack.poll_event().is_some() {}
        if server.is_none() {
            server = link.hosts[1].stack.accept(listener)?.map(|(id, _)| id);
        }
        let now = link.clock.now();
        if connected && sent < data.len() {
            let space = link.hosts[0]
                .stack
                .connection(client)
                .map_or(0, |conn| conn.tx_buffer.available());
            if space > 0 {
                sent += link.hosts[0].stack.send(client, &data[sent..], now)?;
            }
        }
        if let Some(server) = server {
            if let TcpRead::Data(chunk) = link.hosts[1].stack.recv(server, usize::MAX, now)? {
                received.extend(chunk);
                continue;
            }
        }
        if !link.step() {
            anyhow::bail!("Simulation stalled at {} of {} bytes.", received.len(), data.len());
        }
    }
    anyhow::ensure!(received == data, "Received data differs from what was sent.");

    let elapsed = link.clock.now() - start;
    let conn = link.hosts[0]
        .stack
        .connection(client)
        .context("Client socket vanished.")?;
    println!("Transfer complete!");
    println!("congestion control: {}", conn.cong.name());
    println!("bytes: {} in {:?}", received.len(), elapsed);
    println!(
        "goodput: {:.3} Mbit/s",
        received.len() as f64 * 8.0 / elapsed.as_secs_f64() / 1e6
    );
    println!(
        "dropped: {} retransmitted bytes: {} lost bytes: {}",
        link.dropped,
        conn.tx_buffer.total_retrans(),
        conn.tx_buffer.total_lost()
    );
    println!(
        "cwnd: {} srtt: {:?} min_rtt: {:?} pacing_rate: {} B/s",
        conn.tcb.cwnd,
        conn.rtt.srtt(),
        conn.tcb.min_rtt,
        conn.tcb.pacing_rate
    );
    println!("head: {}", hex::encode(&received[..received.len().min(16)]));
    Ok(())
}
