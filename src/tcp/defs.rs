use std::fmt::{self, Display};
use std::net::SocketAddrV4;
use thiserror::Error;

// https://www.iana.org/assignments/tcp-parameters/tcp-parameters.xhtml
pub enum TcpOptionKind {
    // 8 bit
    EndOption = 0x00,      // mandatory
    NoOperation = 0x01,    // mandatory, used for word boundary align
    MaxSegmentSize = 0x02, // mandatory
    WindowScale = 0x3,     // https://datatracker.ietf.org/doc/html/rfc7323#section-2
    SackPermission = 0x04, // rfc2018, rfc2883
    SackOption = 0x05,     // rfc2018, rfc2883
    Timestamp = 0x08,      // https://datatracker.ietf.org/doc/html/rfc7323#section-3
    Unknown,
}

impl From<u8> for TcpOptionKind {
    fn from(value: u8) -> Self {
        match value {
            v if v == TcpOptionKind::EndOption as u8 => TcpOptionKind::EndOption,
            v if v == TcpOptionKind::NoOperation as u8 => TcpOptionKind::NoOperation,
            v if v == TcpOptionKind::MaxSegmentSize as u8 => TcpOptionKind::MaxSegmentSize,
            v if v == TcpOptionKind::WindowScale as u8 => TcpOptionKind::WindowScale,
            v if v == TcpOptionKind::SackPermission as u8 => TcpOptionKind::SackPermission,
            v if v == TcpOptionKind::SackOption as u8 => TcpOptionKind::SackOption,
            v if v == TcpOptionKind::Timestamp as u8 => TcpOptionKind::Timestamp,
            _ => TcpOptionKind::Unknown,
        }
    }
}

impl From<TcpOptionKind> for u8 {
    fn from(t: TcpOptionKind) -> Self {
        t as u8
    }
}

// Declaration order matters: states up to Established are "not closing".
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub enum TcpStatus {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
}

impl Display for TcpStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TcpStatus::Listen => write!(f, "LISTEN"),
            TcpStatus::SynSent => write!(f, "SYN-SENT"),
            TcpStatus::SynRcvd => write!(f, "SYN-RCVD"),
            TcpStatus::Established => write!(f, "ESTABLISHED"),
            TcpStatus::FinWait1 => write!(f, "FIN-WAIT-1"),
            TcpStatus::FinWait2 => write!(f, "FIN-WAIT-2"),
            TcpStatus::Closing => write!(f, "CLOSING"),
            TcpStatus::TimeWait => write!(f, "TIME-WAIT"),
            TcpStatus::CloseWait => write!(f, "CLOSE-WAIT"),
            TcpStatus::LastAck => write!(f, "LAST-ACK"),
            TcpStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Congestion-avoidance state machine, ordered as in Linux `tcp_ca_state`.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Default)]
pub enum TcpCongState {
    #[default]
    Open,
    Disorder,
    Cwr,
    Recovery,
    Loss,
}

impl Display for TcpCongState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TcpCongState::Open => write!(f, "CA_OPEN"),
            TcpCongState::Disorder => write!(f, "CA_DISORDER"),
            TcpCongState::Cwr => write!(f, "CA_CWR"),
            TcpCongState::Recovery => write!(f, "CA_RECOVERY"),
            TcpCongState::Loss => write!(f, "CA_LOSS"),
        }
    }
}

/// Events a congestion controller is told about outside of ACK processing.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum TcpCaEvent {
    TxStart,
    CwndRestart,
    CompleteCwr,
    Loss,
    EcnNoCe,
    EcnIsCe,
    DelayedAck,
    NonDelayedAck,
}

// rfc3168
#[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
pub enum EcnState {
    #[default]
    Disabled,
    Idle,
    CeRcvd,
    SendingEce,
    EceRcvd,
    CwrSent,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TcpError {
    #[error("Send buffer is full. requested: {requested} available: {available}")]
    BufferFull { requested: usize, available: usize },
    #[error("Socket (id={id}) is not connected.")]
    NotConnected { id: usize },
    #[error("Socket (id={id}) cannot do this in state {status}.")]
    InvalidState { id: usize, status: TcpStatus },
    #[error("No ephemeral port available.")]
    NoEphemeralPort,
    #[error("Address {addr} is already in use.")]
    AddressInUse { addr: SocketAddrV4 },
    #[error("Socket (id={id}) has been shut down for sending.")]
    ShutdownSend { id: usize },
    #[error("No tcp socket for id={id}.")]
    NoSuchSocket { id: usize },
    #[error("Connection refused. socket id: {id} remote addr: {addr}")]
    ConnectionRefused { id: usize, addr: SocketAddrV4 },
    #[error("Connection reset. socket id: {id} remote addr: {addr}")]
    ConnectionReset { id: usize, addr: SocketAddrV4 },
    #[error("Connection timed out. socket id: {id} remote addr: {addr}")]
    TimedOut { id: usize, addr: SocketAddrV4 },
}
