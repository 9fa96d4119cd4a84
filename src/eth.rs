// SPDX-License-Identifier: Apache-2.0

use log::{trace, warn};
use std::{fmt, io, net::Ipv4Addr, num::Wrapping};

/// Maximum number of targets delivered in one target list.
pub const MAX_TARGETS: usize = 512;

/// Size of the largest datagram emitted by the sensor.
pub const MAX_DATAGRAM_SIZE: usize = DataPacket::LEN;

/// Transport errors for the sensor session and the target list stream.
///
/// The variant order follows the numeric result codes reported by
/// [`Error::code`].
#[derive(Debug)]
pub enum Error {
    /// The session handle was never opened or has already been closed.
    HandleNotInitialized,
    /// The socket could not be created.
    CreateHandle(io::Error),
    /// Another live session in this process owns the UDP port.
    AlreadyInitialized(u16),
    /// The UDP port is held by another process.
    PortInUse(u16),
    /// The underlying connection was closed.
    ConnectionClosed,
    /// The underlying connection was reset by the peer.
    ConnectionReset,
    /// A frame started but was not completed in time.
    CommunicationTimeout,
    /// Any other socket failure while receiving.
    CommunicationError(io::Error),
    /// The session was lost after a reset or close and must be reopened.
    ConnectionLost,
    /// The header announced more targets than the data packets carried.
    TargetNotEnoughData { announced: usize, received: usize },
    /// A datagram or target record had an unexpected size.
    TargetDataSize(usize),
    /// The process-wide port registry is poisoned.
    MutexError,
    /// No local interface owns the requested address.
    NetworkInterface(Ipv4Addr),
}

impl Error {
    /// Numeric result code as reported by the sensor API, `0` being success.
    pub fn code(&self) -> u32 {
        match self {
            Error::HandleNotInitialized => 0x01,
            Error::CreateHandle(_) => 0x04,
            Error::AlreadyInitialized(_) => 0x07,
            Error::PortInUse(_) => 0x08,
            Error::ConnectionClosed => 0x09,
            Error::ConnectionReset => 0x0A,
            Error::CommunicationTimeout => 0x0B,
            Error::CommunicationError(_) => 0x0C,
            Error::ConnectionLost => 0x0D,
            Error::TargetNotEnoughData { .. } => 0x0E,
            Error::TargetDataSize(_) => 0x10,
            Error::MutexError => 0x14,
            Error::NetworkInterface(_) => 0x15,
        }
    }

    /// Returns true if the session cannot be used anymore and must be
    /// reopened.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::ConnectionReset | Error::ConnectionLost
        )
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            io::ErrorKind::TimedOut => Error::CommunicationTimeout,
            _ => Error::CommunicationError(err),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::HandleNotInitialized => write!(f, "handle not initialised"),
            Error::AlreadyInitialized(port) => {
                write!(f, "port {} already initialised", port)
            }
            Error::CreateHandle(err) => write!(f, "create handle failed: {}", err),
            Error::PortInUse(port) => write!(f, "port {} in use", port),
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::ConnectionReset => write!(f, "connection reset"),
            Error::CommunicationTimeout => write!(f, "communication timeout"),
            Error::CommunicationError(err) => write!(f, "communication error: {}", err),
            Error::ConnectionLost => write!(f, "connection lost"),
            Error::TargetNotEnoughData {
                announced,
                received,
            } => write!(
                f,
                "not enough target data [{}/{}]",
                received, announced
            ),
            Error::TargetDataSize(len) => write!(f, "unexpected target data size: {}", len),
            Error::MutexError => write!(f, "mutex error"),
            Error::NetworkInterface(ip) => write!(f, "no network interface for {}", ip),
        }
    }
}

/// One radar reflection of a single measurement cycle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Target {
    /// Signal strength in dB
    pub signal_strength: f32,
    /// Range in meters
    pub range: f32,
    /// Radial velocity in m/s
    pub velocity: f32,
    /// Azimuth angle in degrees
    pub angle_azimuth: f32,
    pub reserved1: f32,
    pub reserved2: f32,
}

impl Target {
    /// Length of a target record in bytes/octets.
    pub const LEN: usize = 24;

    /// Decodes a target record, the slice must hold at least [`Target::LEN`]
    /// bytes.
    fn from_le_slice(slice: &[u8]) -> Target {
        let f = |i: usize| {
            let bytes = [slice[i], slice[i + 1], slice[i + 2], slice[i + 3]];
            f32::from_le_bytes(bytes)
        };
        Target {
            signal_strength: f(0),
            range: f(4),
            velocity: f(8),
            angle_azimuth: f(12),
            reserved1: f(16),
            reserved2: f(20),
        }
    }

    /// Encodes the target record as transmitted by the sensor.
    pub fn to_le_bytes(&self) -> [u8; Target::LEN] {
        let mut out = [0u8; Target::LEN];
        let fields = [
            self.signal_strength,
            self.range,
            self.velocity,
            self.angle_azimuth,
            self.reserved1,
            self.reserved2,
        ];
        for (chunk, value) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{},\t{},\t{},\t{}",
            self.angle_azimuth, self.range, self.velocity, self.signal_strength
        )
    }
}

/// Targets of one measurement cycle, bounded by [`MAX_TARGETS`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TargetList {
    frame_id: u16,
    targets: Vec<Target>,
}

impl TargetList {
    /// Builds a target list, keeping the first [`MAX_TARGETS`] targets.  The
    /// result is `Full` when targets had to be dropped.
    pub fn truncate(frame_id: u16, mut targets: Vec<Target>) -> TargetListStatus {
        let full = targets.len() > MAX_TARGETS;
        targets.truncate(MAX_TARGETS);

        let list = TargetList { frame_id, targets };
        if full {
            TargetListStatus::Full(list)
        } else {
            TargetListStatus::Ok(list)
        }
    }

    /// Frame identifier assigned by the sensor, wraps at 65536.
    #[inline]
    pub fn frame_id(&self) -> u16 {
        self.frame_id
    }

    /// Number of valid targets.
    #[inline]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    #[inline]
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Returns the target with the greatest signal strength.  Ties resolve to
    /// the first occurrence and an empty list yields a zeroed target.
    pub fn strongest(&self) -> Target {
        let mut targets = self.targets.iter();
        let mut best = match targets.next() {
            Some(first) => first,
            None => return Target::default(),
        };

        for target in targets {
            if target.signal_strength > best.signal_strength || best.signal_strength.is_nan() {
                best = target;
            }
        }

        *best
    }
}

/// Outcome of a single target list request.  Only `Ok` and `Full` carry
/// targets.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetListStatus {
    Ok(TargetList),
    /// The sensor reported more than [`MAX_TARGETS`] targets, the surplus
    /// was dropped.
    Full(TargetList),
    /// No new frame is available yet, request again later.
    AlreadyRequested,
    /// No sensor is producing data.
    NotActive,
    /// The frame failed its checksum and was discarded.
    DataCorrupted,
}

impl TargetListStatus {
    /// Numeric status code as reported by the sensor API.
    pub fn code(&self) -> u32 {
        match self {
            TargetListStatus::Ok(_) => 0x00,
            TargetListStatus::Full(_) => 0x01,
            TargetListStatus::AlreadyRequested => 0x02,
            TargetListStatus::NotActive => 0x03,
            TargetListStatus::DataCorrupted => 0x04,
        }
    }

    /// Returns the target list for `Ok` and `Full` responses.
    pub fn target_list(&self) -> Option<&TargetList> {
        match self {
            TargetListStatus::Ok(list) | TargetListStatus::Full(list) => Some(list),
            _ => None,
        }
    }
}

impl fmt::Display for TargetListStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TargetListStatus::Ok(list) => write!(f, "ok ({} targets)", list.len()),
            TargetListStatus::Full(list) => write!(f, "full ({} targets)", list.len()),
            TargetListStatus::AlreadyRequested => write!(f, "already requested"),
            TargetListStatus::NotActive => write!(f, "not active"),
            TargetListStatus::DataCorrupted => write!(f, "data corrupted"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    pub frame_id: u16,
    pub firmware_major: u16,
    pub firmware_fix: u16,
    pub firmware_minor: u16,
    pub nr_of_detections: u16,
    pub nr_of_targets: u16,
    pub checksum: u32,
    pub bytes_per_target: u16,
    pub nr_of_data_packets: u16,
}

impl Header {
    /// Length of the header datagram in bytes/octets.
    pub const LEN: usize = 256;
}

/// A slice containing a target list header datagram.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HeaderSlice<'a> {
    slice: &'a [u8],
}

impl<'a> HeaderSlice<'a> {
    pub fn from_slice(slice: &'a [u8]) -> Result<HeaderSlice<'a>, Error> {
        if slice.len() != Header::LEN {
            return Err(Error::TargetDataSize(slice.len()));
        }

        Ok(HeaderSlice { slice })
    }

    pub fn to_header(&self) -> Header {
        Header {
            frame_id: self.frame_id(),
            firmware_major: self.u16_at(2),
            firmware_fix: self.u16_at(4),
            firmware_minor: self.u16_at(6),
            nr_of_detections: self.u16_at(8),
            nr_of_targets: self.nr_of_targets(),
            checksum: self.checksum(),
            bytes_per_target: self.bytes_per_target(),
            nr_of_data_packets: self.nr_of_data_packets(),
        }
    }

    #[inline]
    fn u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.slice[offset], self.slice[offset + 1]])
    }

    /// Returns the frame identifier.
    #[inline]
    pub fn frame_id(&self) -> u16 {
        self.u16_at(0)
    }

    /// Returns the number of targets in the frame.
    #[inline]
    pub fn nr_of_targets(&self) -> u16 {
        self.u16_at(10)
    }

    /// Returns the checksum over the target records.
    #[inline]
    pub fn checksum(&self) -> u32 {
        u32::from_le_bytes([
            self.slice[12],
            self.slice[13],
            self.slice[14],
            self.slice[15],
        ])
    }

    /// Returns the size of one target record in bytes.
    #[inline]
    pub fn bytes_per_target(&self) -> u16 {
        self.u16_at(16)
    }

    /// Returns the number of data datagrams following this header.
    #[inline]
    pub fn nr_of_data_packets(&self) -> u16 {
        self.u16_at(18)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataPacket {
    pub frame_id: u16,
    pub packet_number: u16,
}

impl DataPacket {
    /// Length of the data datagram in bytes/octets.
    pub const LEN: usize = 1012;
    /// Length of the data datagram header in bytes/octets.
    pub const HEADER_LEN: usize = 4;
    /// Number of target slots carried by one data datagram.
    pub const TARGETS: usize = 42;
}

/// A slice containing a target list data datagram.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DataPacketSlice<'a> {
    slice: &'a [u8],
}

impl<'a> DataPacketSlice<'a> {
    pub fn from_slice(slice: &'a [u8]) -> Result<DataPacketSlice<'a>, Error> {
        if slice.len() != DataPacket::LEN {
            return Err(Error::TargetDataSize(slice.len()));
        }

        Ok(DataPacketSlice { slice })
    }

    pub fn to_header(&self) -> DataPacket {
        DataPacket {
            frame_id: self.frame_id(),
            packet_number: self.packet_number(),
        }
    }

    /// Returns the frame identifier.
    #[inline]
    pub fn frame_id(&self) -> u16 {
        u16::from_le_bytes([self.slice[0], self.slice[1]])
    }

    /// Returns the packet number within the frame.
    #[inline]
    pub fn packet_number(&self) -> u16 {
        u16::from_le_bytes([self.slice[2], self.slice[3]])
    }

    /// Returns the slice containing the target slots.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        &self.slice[DataPacket::HEADER_LEN..]
    }
}

/// Wrapping 32-bit byte sum used by the sensor to protect target records.
pub fn checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(Wrapping(0u32), |sum, b| sum + Wrapping(*b as u32))
        .0
}

/// A frame announced by a header whose data datagrams are still arriving.
#[derive(Debug)]
struct PendingFrame {
    header: Header,
    received: Vec<bool>,
    received_packets: u16,
    data: Vec<u8>,
}

impl PendingFrame {
    fn new(header: Header) -> PendingFrame {
        let packets = header.nr_of_data_packets as usize;
        let targets = (header.nr_of_targets as usize).min(packets * DataPacket::TARGETS);
        PendingFrame {
            header,
            received: vec![false; packets],
            received_packets: 0,
            data: vec![0; targets * Target::LEN],
        }
    }

    /// Copies the payload to the slot given by its packet number.  Payload
    /// bytes past the announced targets are dropped.
    fn insert(&mut self, packet_number: usize, payload: &[u8]) {
        self.received[packet_number] = true;
        self.received_packets += 1;

        let start = packet_number * DataPacket::TARGETS * Target::LEN;
        if start < self.data.len() {
            let len = payload.len().min(self.data.len() - start);
            self.data[start..start + len].copy_from_slice(&payload[..len]);
        }
    }
}

/// Assembles header and data datagrams into target lists.
#[derive(Debug, Default)]
pub struct TargetListReader {
    pending: Option<PendingFrame>,
    last_frame: Option<Wrapping<u16>>,
    frames_lost: u64,
}

impl TargetListReader {
    pub fn new() -> TargetListReader {
        TargetListReader::default()
    }

    /// Returns true while a frame has been announced but not completed.
    #[inline]
    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    /// Number of frames skipped by the sensor stream so far.
    #[inline]
    pub fn frames_lost(&self) -> u64 {
        self.frames_lost
    }

    /// Drops any partially received frame.
    pub fn reset(&mut self) {
        self.pending = None;
    }

    fn start_of_frame(&mut self, header: &HeaderSlice) -> Result<Option<TargetListStatus>, Error> {
        let header = header.to_header();
        trace!("{:?}", header);

        if let Some(pending) = self.pending.take() {
            warn!(
                "frame {} incomplete [{}/{}] dropped",
                pending.header.frame_id,
                pending.received_packets,
                pending.header.nr_of_data_packets
            );
        }

        if header.bytes_per_target as usize != Target::LEN {
            return Err(Error::TargetDataSize(header.bytes_per_target as usize));
        }

        let frame_id = Wrapping(header.frame_id);
        if let Some(last) = self.last_frame {
            if last == frame_id {
                return Ok(Some(TargetListStatus::AlreadyRequested));
            }

            let expected = last + Wrapping(1);
            if expected != frame_id {
                let lost = (frame_id - expected).0;
                warn!(
                    "frame loss: expected {} got {} ({} lost)",
                    expected, frame_id, lost
                );
                self.frames_lost += lost as u64;
            }
        }

        let packets = header.nr_of_data_packets;
        self.pending = Some(PendingFrame::new(header));

        if packets == 0 {
            return self.end_of_frame().map(Some);
        }

        Ok(None)
    }

    fn frame_data(&mut self, packet: &DataPacketSlice) -> Result<Option<TargetListStatus>, Error> {
        let pending = match &mut self.pending {
            Some(pending) => pending,
            // The header of this frame went by before we started listening.
            None => return Ok(Some(TargetListStatus::AlreadyRequested)),
        };

        if pending.header.frame_id != packet.frame_id() {
            warn!(
                "data packet for frame {} while assembling frame {}",
                packet.frame_id(),
                pending.header.frame_id
            );
            self.last_frame = Some(Wrapping(pending.header.frame_id));
            self.pending = None;
            return Ok(Some(TargetListStatus::DataCorrupted));
        }

        let packet_number = packet.packet_number() as usize;
        if pending.received.get(packet_number) != Some(&false) {
            warn!(
                "frame {} packet {} out of range or repeated [{} packets]",
                pending.header.frame_id,
                packet_number,
                pending.header.nr_of_data_packets
            );
            self.last_frame = Some(Wrapping(pending.header.frame_id));
            self.pending = None;
            return Ok(Some(TargetListStatus::DataCorrupted));
        }

        trace!(
            "frame {} packet {} [{}/{}]",
            packet.frame_id(),
            packet_number,
            pending.received_packets + 1,
            pending.header.nr_of_data_packets
        );

        pending.insert(packet_number, packet.payload());

        if pending.received_packets < pending.header.nr_of_data_packets {
            return Ok(None);
        }

        self.end_of_frame().map(Some)
    }

    fn end_of_frame(&mut self) -> Result<TargetListStatus, Error> {
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => return Ok(TargetListStatus::AlreadyRequested),
        };
        let header = pending.header;
        self.last_frame = Some(Wrapping(header.frame_id));

        let announced = header.nr_of_targets as usize;
        let received = pending.received_packets as usize * DataPacket::TARGETS;
        if announced > received {
            return Err(Error::TargetNotEnoughData {
                announced,
                received,
            });
        }

        let data = &pending.data;
        let sum = checksum(data);
        if sum != header.checksum {
            warn!(
                "frame {} checksum 0x{:08X} expected 0x{:08X}",
                header.frame_id, sum, header.checksum
            );
            return Ok(TargetListStatus::DataCorrupted);
        }

        let targets = data
            .chunks_exact(Target::LEN)
            .map(Target::from_le_slice)
            .collect();

        Ok(TargetList::truncate(header.frame_id, targets))
    }

    /// Feeds one datagram to the reader.  Returns a status once a frame is
    /// complete or the datagram settles the request on its own.
    pub fn read(&mut self, slice: &[u8]) -> Result<Option<TargetListStatus>, Error> {
        match slice.len() {
            Header::LEN => self.start_of_frame(&HeaderSlice::from_slice(slice)?),
            DataPacket::LEN => self.frame_data(&DataPacketSlice::from_slice(slice)?),
            len => Err(Error::TargetDataSize(len)),
        }
    }
}

/// Encodes a frame the way the sensor transmits it: one header datagram
/// followed by the data datagrams.  Unused target slots are zero filled.
pub fn encode_frame(frame_id: u16, targets: &[Target]) -> Vec<Vec<u8>> {
    let packets = targets.len().div_ceil(DataPacket::TARGETS);
    let records: Vec<u8> = targets.iter().flat_map(|t| t.to_le_bytes()).collect();

    let mut header = vec![0u8; Header::LEN];
    header[0..2].copy_from_slice(&frame_id.to_le_bytes());
    header[8..10].copy_from_slice(&(targets.len() as u16).to_le_bytes());
    header[10..12].copy_from_slice(&(targets.len() as u16).to_le_bytes());
    header[12..16].copy_from_slice(&checksum(&records).to_le_bytes());
    header[16..18].copy_from_slice(&(Target::LEN as u16).to_le_bytes());
    header[18..20].copy_from_slice(&(packets as u16).to_le_bytes());

    let mut datagrams = vec![header];
    for (i, chunk) in records
        .chunks(DataPacket::TARGETS * Target::LEN)
        .enumerate()
    {
        let mut packet = vec![0u8; DataPacket::LEN];
        packet[0..2].copy_from_slice(&frame_id.to_le_bytes());
        packet[2..4].copy_from_slice(&(i as u16).to_le_bytes());
        packet[DataPacket::HEADER_LEN..DataPacket::HEADER_LEN + chunk.len()]
            .copy_from_slice(chunk);
        datagrams.push(packet);
    }

    datagrams
}
