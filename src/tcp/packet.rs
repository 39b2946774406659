use crate::tcp::{defs::TcpOptionKind, seq::SequenceNumber32};
use anyhow::Result;
use bitflags::bitflags;

// Tcp header max size is 60 (15*4) bytes because Max Data Offset is 15 (0b1111).
pub const TCP_HEADER_LENGTH_BASIC: usize = 20;
pub const TCP_OPTION_LENGTH_MAX: usize = 40;
// "The maximum scale exponent is limited to 14 for a maximum permissible receive window size
// of 1 GiB (2^(14+16))." rfc7323
pub const TCP_MAX_WINDOW_SHIFT: u8 = 14;
pub const TCP_SACK_MAX_BLOCKS: usize = 4;

// https://datatracker.ietf.org/doc/html/rfc9293
//
// 0                   1                   2                   3
// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |          Source Port          |       Destination Port        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                        Sequence Number                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                    Acknowledgment Number                      |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |  Data |       |C|E|U|A|P|R|S|F|                               |
// | Offset| Rsrvd |W|C|R|C|S|S|Y|I|            Window             |
// |       |       |R|E|G|K|H|T|N|N|                               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |           Checksum            |         Urgent Pointer        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                           [Options]                           |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                                                               :
// :                             Data                              :
// :                                                               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
// The checksum belongs to the network layer together with the pseudo header; it is carried
// through untouched here.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct TcpPacket {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: SequenceNumber32,
    pub ack_number: SequenceNumber32,
    pub offset: u8, // 4 bit (payload begins from 4*offset bytes)
    pub flag: TcpFlag,
    pub window_size: u16,
    pub checksum: u16,
    pub urg_pointer: u16,
    pub option_raw: Vec<u8>,
    pub option: TcpOption,
    pub payload: Vec<u8>,
}

impl TcpPacket {
    pub fn new() -> Self {
        Self {
            option_raw: Vec::new(),
            option: TcpOption::new(),
            payload: Vec::new(),
            ..Default::default()
        }
    }

    pub fn read(&mut self, segment: &[u8]) -> Result<()> {
        let tcp_len = segment.len();
        if tcp_len > 0xffff {
            anyhow::bail!(
                "TCP segment length is {}, must be smaller than 65536+1.",
                tcp_len
            );
        } else if tcp_len < TCP_HEADER_LENGTH_BASIC {
            anyhow::bail!(
                "TCP segment length is {}, must be larger than header length ({}).",
                tcp_len,
                TCP_HEADER_LENGTH_BASIC
            );
        }

        self.src_port = u16::from_be_bytes(segment[0..2].try_into()?);
        self.dst_port = u16::from_be_bytes(segment[2..4].try_into()?);
        self.seq_number = u32::from_be_bytes(segment[4..8].try_into()?).into();
        self.ack_number = u32::from_be_bytes(segment[8..12].try_into()?).into();
        self.offset = segment[12] >> 4;
        let offset_bytes = (self.offset as usize) * 4;
        anyhow::ensure!(
            offset_bytes >= TCP_HEADER_LENGTH_BASIC,
            "TCP header's data offset is {} bytes, smaller than the basic header.",
            offset_bytes
        );
        anyhow::ensure!(
            tcp_len >= offset_bytes,
            "TCP segment length is {}, but header's data offset indicate {}.",
            tcp_len,
            offset_bytes
        );
        self.flag = TcpFlag::from_bits_retain(segment[13]);
        self.window_size = u16::from_be_bytes(segment[14..16].try_into()?);
        self.checksum = u16::from_be_bytes(segment[16..18].try_into()?);
        self.urg_pointer = u16::from_be_bytes(segment[18..20].try_into()?);
        self.option_raw = segment[TCP_HEADER_LENGTH_BASIC..offset_bytes].to_vec();
        self.option = TcpOption::new();
        self.option.read(&self.option_raw)?;
        self.payload = segment[offset_bytes..].to_vec();

        Ok(())
    }

    pub fn create_header(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(TCP_HEADER_LENGTH_BASIC + self.option_raw.len());
        header.extend_from_slice(&self.src_port.to_be_bytes());
        header.extend_from_slice(&self.dst_port.to_be_bytes());
        header.extend_from_slice(&self.seq_number.value().to_be_bytes());
        header.extend_from_slice(&self.ack_number.value().to_be_bytes());

        let offset_flags = self.flag.bits() as u16 | ((self.offset as u16) << 12);
        header.extend_from_slice(&offset_flags.to_be_bytes());

        header.extend_from_slice(&self.window_size.to_be_bytes());
        header.extend_from_slice(&self.checksum.to_be_bytes());
        header.extend_from_slice(&self.urg_pointer.to_be_bytes());
        header.extend(&self.option_raw);

        header
    }

    pub fn create_packet(&mut self) -> Vec<u8> {
        self.set_packet_params();
        let mut packet = self.create_header();
        packet.extend_from_slice(&self.payload);

        packet
    }

    fn set_option_raw(&mut self) {
        self.option_raw = self.option.create_packet_option();
    }

    fn set_offset(&mut self) {
        self.offset = ((TCP_HEADER_LENGTH_BASIC + self.option_raw.len()) / 4) as u8;
    }

    fn set_packet_params(&mut self) {
        // set option_raw and offset
        self.set_option_raw();
        self.set_offset();
    }

    /// Sequence space consumed by this segment (payload plus SYN and FIN).
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flag.contains(TcpFlag::SYN) {
            len += 1;
        }
        if self.flag.contains(TcpFlag::FIN) {
            len += 1;
        }
        len
    }

    pub fn create_reply_base(&self) -> Self {
        let mut reply = Self::new();
        reply.src_port = self.dst_port;
        reply.dst_port = self.src_port;
        reply
    }

    // <SEQ=SEG.ACK><CTL=RST> rfc9293
    pub fn create_rst(&self) -> Self {
        let mut rst = self.create_reply_base();
        rst.seq_number = self.ack_number;
        rst.flag = TcpFlag::RST;
        rst
    }

    // <SEQ=0><ACK=SEG.SEQ+SEG.LEN><CTL=RST,ACK> rfc9293
    pub fn create_rst_ack(&self) -> Self {
        let mut rst = self.create_reply_base();
        rst.seq_number = SequenceNumber32::new(0);
        rst.ack_number = self.seq_number + self.seq_len();
        rst.flag = TcpFlag::RST | TcpFlag::ACK;
        rst
    }

    pub fn print_general_info(&self) -> String {
        format!(
            "SEGINFO: SRC={} DST={} SEQ={} ACK={} LENGTH={} WND(RAW)={} FLAG={:?}",
            self.src_port,
            self.dst_port,
            self.seq_number,
            self.ack_number,
            self.payload.len(),
            self.window_size,
            self.flag
        )
    }
}

bitflags! {
    #[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
    pub struct TcpFlag: u8 {
        const FIN = 0b00_00_00_01; // No more data from sender.
        const SYN = 0b00_00_00_10; // Synchronize sequence numbers.
        const RST = 0b00_00_01_00; // Reset the connection.
        const PSH = 0b00_00_10_00; // Push function
        const ACK = 0b00_01_00_00; // Acknowledgment field
        const URG = 0b00_10_00_00; // Urgent pointer field
        const ECE = 0b01_00_00_00; // ECN-Echo
        const CWR = 0b10_00_00_00; // Congestion Window Reduced
    }
}

pub type SackBlock = (SequenceNumber32, SequenceNumber32);

#[derive(Default, Debug, Clone, PartialEq)]
pub struct TcpOption {
    pub mss: Option<u16>,                       // kind=2 Maximum Segment Size  2 bytes
    pub window_scale: Option<u8>,               // kind=3 Window Scale Option   1 bytes
    pub sack_permitted: bool, // kind=4 Sack-Permitted Option 0 bytes (only kind and length=2)
    pub sack: Option<Vec<SackBlock>>,           // kind=5 Sack Option           8 bytes * n
    pub timestamps: Option<TcpOptionTimestamp>, // kind=8 Timestamps Option     4 bytes * 2
}

impl TcpOption {
    pub fn new() -> Self {
        Self {
            mss: None,
            window_scale: None,
            sack_permitted: false,
            sack: None,
            timestamps: None,
        }
    }

    pub fn read(&mut self, option: &[u8]) -> Result<()> {
        let mut offset: usize = 0;
        let length = option.len();
        while offset < length {
            let kind = option[offset];
            match TcpOptionKind::from(kind) {
                TcpOptionKind::EndOption => {
                    // Everything after the end of option list is padding.
                    break;
                }
                TcpOptionKind::NoOperation => {
                    offset += 1;
                }
                TcpOptionKind::MaxSegmentSize => {
                    anyhow::ensure!(
                        offset + 4 <= length,
                        "MaxSegmentSize needs 4 bytes but only {} bytes left.",
                        length - offset
                    );
                    let len = option[offset + 1];
                    anyhow::ensure!(
                        len == 4,
                        "Length field of MaxSegmentSize must be 4 but is {}.",
                        len
                    );
                    self.mss = Some(u16::from_be_bytes(
                        option[offset + 2..offset + 4].try_into()?,
                    ));
                    offset += 4;
                }
                TcpOptionKind::WindowScale => {
                    anyhow::ensure!(
                        offset + 3 <= length,
                        "WindowScale needs 3 bytes but only {} bytes left.",
                        length - offset
                    );
                    let len = option[offset + 1];
                    anyhow::ensure!(
                        len == 3,
                        "Length field of WindowScale must be 3 but is {}.",
                        len
                    );
                    self.window_scale = Some(option[offset + 2]);
                    offset += 3;
                }
                TcpOptionKind::SackPermission => {
                    anyhow::ensure!(
                        offset + 2 <= length,
                        "SackPermission needs 2 bytes but only {} bytes left.",
                        length - offset
                    );
                    let len = option[offset + 1];
                    anyhow::ensure!(
                        len == 2,
                        "Length field of SackPermission must be 2 but is {}.",
                        len
                    );
                    self.sack_permitted = true;
                    offset += 2;
                }
                TcpOptionKind::SackOption => {
                    anyhow::ensure!(
                        offset + 2 <= length,
                        "SackOption needs 2 bytes but only {} bytes left.",
                        length - offset
                    );
                    let len = option[offset + 1] as usize;
                    anyhow::ensure!(
                        offset + len <= length,
                        "Length field of SackOption is {} but only {} bytes left.",
                        len,
                        length - offset
                    );
                    anyhow::ensure!(
                        len >= 10 && (len - 2) % 8 == 0,
                        "SackOption payload must be 8 bytes aligned but len-2 is {}.",
                        len.saturating_sub(2)
                    );
                    anyhow::ensure!(
                        (len - 2) / 8 <= TCP_SACK_MAX_BLOCKS,
                        "SackOption carries {} blocks, at most {} are allowed.",
                        (len - 2) / 8,
                        TCP_SACK_MAX_BLOCKS
                    );
                    let mut blocks = Vec::with_capacity((len - 2) / 8);
                    for i in (offset + 2..offset + len).step_by(8) {
                        blocks.push((
                            u32::from_be_bytes(option[i..i + 4].try_into()?).into(),
                            u32::from_be_bytes(option[i + 4..i + 8].try_into()?).into(),
                        ));
                    }
                    self.sack = Some(blocks);
                    offset += len;
                }
                TcpOptionKind::Timestamp => {
                    anyhow::ensure!(
                        offset + 10 <= length,
                        "Timestamp needs 10 bytes but only {} bytes left.",
                        length - offset
                    );
                    let len = option[offset + 1];
                    anyhow::ensure!(
                        len == 10,
                        "Length field of Timestamp must be 10 but is {}.",
                        len
                    );
                    self.timestamps = Some(TcpOptionTimestamp {
                        ts_value: u32::from_be_bytes(option[offset + 2..offset + 6].try_into()?),
                        ts_echo_reply: u32::from_be_bytes(
                            option[offset + 6..offset + 10].try_into()?,
                        ),
                    });
                    offset += 10;
                }
                TcpOptionKind::Unknown => {
                    log::debug!("Unknown tcp option. kind: {}", kind);
                    anyhow::ensure!(offset + 2 <= length, "This option kind is unknown, at least need 2 bytes but only {} bytes left.", length - offset);
                    let len = option[offset + 1] as usize;
                    anyhow::ensure!(
                        len >= 2 && offset + len <= length,
                        "Length field of unknown option is {} but only {} bytes left.",
                        len,
                        length - offset
                    );
                    offset += len;
                }
            }
        }

        Ok(())
    }

    /// Option bytes this set would occupy once padded.
    pub fn encoded_len(&self) -> usize {
        let mut len = 0;
        if self.mss.is_some() {
            len += 4;
        }
        if self.window_scale.is_some() {
            len += 3;
        }
        if self.sack_permitted {
            len += 2;
        }
        if let Some(sack) = &self.sack {
            len += 2 + sack.len() * 8;
        }
        if self.timestamps.is_some() {
            len += 10;
        }
        len + (4 - len % 4) % 4
    }

    fn create_packet_option(&self) -> Vec<u8> {
        let mut packet = Vec::new();
        if let Some(mss) = self.mss {
            packet.push(u8::from(TcpOptionKind::MaxSegmentSize));
            packet.push(4);
            packet.extend_from_slice(&mss.to_be_bytes());
        }
        if let Some(window) = self.window_scale {
            packet.push(u8::from(TcpOptionKind::WindowScale));
            packet.push(3);
            packet.push(window);
        }
        if self.sack_permitted {
            packet.push(u8::from(TcpOptionKind::SackPermission));
            packet.push(2);
        }
        if let Some(sack) = &self.sack {
            let len = sack.len();
            packet.push(u8::from(TcpOptionKind::SackOption));
            packet.push((len * 8 + 2) as u8);
            for (left, right) in sack {
                packet.extend_from_slice(&left.value().to_be_bytes());
                packet.extend_from_slice(&right.value().to_be_bytes());
            }
        }
        if let Some(TcpOptionTimestamp {
            ts_value,
            ts_echo_reply,
        }) = self.timestamps
        {
            packet.push(u8::from(TcpOptionKind::Timestamp));
            packet.push(10);
            packet.extend_from_slice(&ts_value.to_be_bytes());
            packet.extend_from_slice(&ts_echo_reply.to_be_bytes());
        }
        let len = packet.len();
        let mut padding = vec![u8::from(TcpOptionKind::NoOperation); (4 - len % 4) % 4];
        packet.append(&mut padding);

        packet
    }
}

// https://datatracker.ietf.org/doc/html/rfc7323#section-3
//
// TCP Timestamps option (TSopt):
//
// Kind: 8
//
// Length: 10 bytes
//
//        +-------+-------+---------------------+---------------------+
//        |Kind=8 |  10   |   TS Value (TSval)  |TS Echo Reply (TSecr)|
//        +-------+-------+---------------------+---------------------+
//            1       1              4                     4
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TcpOptionTimestamp {
    pub ts_value: u32,      // 4 bytes
    pub ts_echo_reply: u32, // 4 bytes
}

#[cfg(test)]
mod tcp_tests {
    use super::*;
    use hex::decode;
    use rstest::rstest;

    // Captured IPv4 frames; the first 20 bytes are the IP header.
    const IPV4_HEADER_LEN: usize = 20;

    #[rstest]
    #[case(
        "4500003450bf40008006ff4b0a000091ba0fe618d4a40050dd65a54700000000800220004cbb0000020405b40103030201010402",
        54436,               // src port
        80,                  // dst port
        3714426183,          // sequence number
        0,                   // acknowledgment number
        8,                   // data offset
        0x2,                 // flag
        8192,                // window
        0x4cbb,              // checksum
        0,                   // urg pointer
        TcpOption {
            mss: Some(1460),
            window_scale: Some(2),
            sack_permitted: true,
            sack: None,
            timestamps: None
        },
        ""
    )]
    #[case(
        "45000034000040003c06940bba0fe6180a0000910050d4a496d38404dd65a5488012390818cb0000020405b40101040201030301",
        80,                  // src port
        54436,               // dst port
        2530444292,          // sequence number
        3714426184,          // acknowledgment number
        8,                   // data offset
        0x12,                // flag
        14600,               // window
        0x18cb,              // checksum
        0,                   // urg pointer
        TcpOption {
            mss: Some(1460),
            window_scale: Some(1),
            sack_permitted: true,
            sack: None,
            timestamps: None
        },
        ""
    )]
    #[case(
        "4500003450f640008006ff140a000091ba0fe618d4a40050dd65a68c96d43a858010111c7ee300000101050a96d46dd996d47941",
        54436,               // src port
        80,                  // dst port
        3714426508,          // sequence number
        2530491013,          // acknowledgment number
        8,                   // data offset
        0x10,                // flag
        4380,                // window
        0x7ee3,              // checksum
        0,                   // urg pointer
        TcpOption {
            mss: None,
            window_scale: None,
            sack_permitted: false,
            sack: Some(vec![(SequenceNumber32::new(0x96d46dd9), SequenceNumber32::new(0x96d47941))]),
            timestamps: None
        },
        ""
    )]
    fn test_tcp_packet_read(
        #[case] encoded_packet: &str,
        #[case] expected_src_port: u16,
        #[case] expected_dst_port: u16,
        #[case] expected_seq_number: u32,
        #[case] expected_ack_number: u32,
        #[case] expected_data_offset: u8,
        #[case] expected_flag: u8,
        #[case] expected_window: u16,
        #[case] expected_checksum: u16,
        #[case] expected_urg_pointer: u16,
        #[case] expected_option: TcpOption,
        #[case] tcp_payload_hex: &str,
    ) {
        let packet_data = decode(encoded_packet).expect("Failed to decode hex string");
        let mut tcp_packet = TcpPacket::new();
        let read_result = tcp_packet.read(&packet_data[IPV4_HEADER_LEN..]);
        assert!(
            read_result.is_ok(),
            "TCP packet read failed when it should not have"
        );

        assert_eq!(tcp_packet.src_port, expected_src_port);
        assert_eq!(tcp_packet.dst_port, expected_dst_port);
        assert_eq!(tcp_packet.seq_number.value(), expected_seq_number);
        assert_eq!(tcp_packet.ack_number.value(), expected_ack_number);
        assert_eq!(tcp_packet.offset, expected_data_offset);
        assert_eq!(tcp_packet.flag, TcpFlag::from_bits_retain(expected_flag));
        assert_eq!(tcp_packet.window_size, expected_window);
        assert_eq!(tcp_packet.checksum, expected_checksum);
        assert_eq!(tcp_packet.urg_pointer, expected_urg_pointer);
        assert_eq!(tcp_packet.option, expected_option);

        let payload_data = decode(tcp_payload_hex).expect("Failed to decode payload hex string");
        assert_eq!(
            tcp_packet.payload, payload_data,
            "TCP payload does not match"
        );
    }

    #[rstest]
    // too short packet, header's data offset points beyond the segment
    #[case("4500003450bf40008006ff4b0a000091ba0fe618d4a40050dd65a54700000000800220004cbb0000020405b401030302010104")]
    // window scale option with a length field of 4
    #[case("4500003450bf40008006ff4b0a000091ba0fe618d4a40050dd65a54700000000800220004cbb0000020405b40103040201010402")]
    // sack option whose length is not 8 bytes aligned
    #[case("4500003450f640008006ff140a000091ba0fe618d4a40050dd65a68c96d43a858010111c7ee300000101050996d46dd996d47941")]
    fn test_tcp_packet_read_error(#[case] encoded_packet: &str) {
        let packet_data = decode(encoded_packet).expect("Failed to decode hex string");
        let mut tcp_packet = TcpPacket::new();
        let result = tcp_packet.read(&packet_data[IPV4_HEADER_LEN..]);

        assert!(
            result.is_err(),
            "Expected an error for incorrect TCP packet"
        );
    }

    #[test]
    fn test_tcp_packet_create_with_options() {
        let mut packet = TcpPacket::new();
        packet.src_port = 49152;
        packet.dst_port = 80;
        packet.seq_number = SequenceNumber32::new(1000);
        packet.ack_number = SequenceNumber32::new(2000);
        packet.flag = TcpFlag::ACK | TcpFlag::ECE;
        packet.window_size = 512;
        packet.option.sack = Some(vec![
            (SequenceNumber32::new(3000), SequenceNumber32::new(4000)),
            (SequenceNumber32::new(5000), SequenceNumber32::new(6000)),
        ]);
        packet.option.timestamps = Some(TcpOptionTimestamp {
            ts_value: 7,
            ts_echo_reply: 3,
        });
        packet.payload = b"hello".to_vec();
        let bytes = packet.create_packet();
        // 18 bytes of sack + 10 bytes of timestamp, padded to 28.
        assert_eq!(packet.option.encoded_len(), 28);
        assert_eq!(packet.offset, 12);
        assert_eq!(bytes.len(), 48 + 5);

        let mut parsed = TcpPacket::new();
        parsed.read(&bytes).expect("created segment must parse");
        assert_eq!(parsed, packet);
        assert_eq!(parsed.seq_len(), 5);
    }

    #[test]
    fn test_tcp_packet_rst_reply() {
        let mut syn = TcpPacket::new();
        syn.src_port = 1200;
        syn.dst_port = 2000;
        syn.seq_number = SequenceNumber32::new(u32::MAX);
        syn.flag = TcpFlag::SYN;
        let rst = syn.create_rst_ack();
        assert_eq!(rst.src_port, 2000);
        assert_eq!(rst.dst_port, 1200);
        assert_eq!(rst.ack_number, SequenceNumber32::new(0));
        assert_eq!(rst.flag, TcpFlag::RST | TcpFlag::ACK);
    }
}
