//! Raw HCI socket backend.
//!
//! This backend uses raw Linux HCI sockets to receive LE advertisements
//! without requiring the BlueZ daemon. It can only listen, so it serves the
//! broadcast scales. It requires CAP_NET_RAW and CAP_NET_ADMIN capabilities
//! or root privileges.

use super::{
    ADVERTISEMENT_CHANNEL_BUFFER_SIZE, AdvertisementSource, LinkError, LinkFuture, ScanFilter,
};
use crate::advertisement::ScannedDeviceInfo;
use crate::mac_address::MacAddress;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;
const SOL_HCI: c_int = 0;
const HCI_CHANNEL_RAW: u16 = 0;

// HCI packet types
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Active scanning, so scan responses with the device name arrive too
const LE_SCAN_ACTIVE: u8 = 0x01;

const LE_PUBLIC_ADDRESS: u8 = 0x00;

const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(0x01); // HCI command packet type
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// LE Set Scan Parameters: scan type, interval and window (0.625 ms units, LE),
/// own address type, filter policy.
fn scan_parameters(scan_type: u8, interval: u16, window: u16) -> Vec<u8> {
    let mut params = vec![scan_type];
    params.extend_from_slice(&interval.to_le_bytes());
    params.extend_from_slice(&window.to_le_bytes());
    params.push(LE_PUBLIC_ADDRESS);
    params.push(FILTER_POLICY_ACCEPT_ALL);
    params
}

/// Turn a failed libc call into a link error naming the step.
fn os_check(failed: bool, step: &str) -> Result<(), LinkError> {
    if failed {
        return Err(LinkError::Bluetooth(format!(
            "{step} failed: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Raw HCI socket bound to `dev_id`. Non-blocking, as `AsyncFd` needs.
fn hci_socket(dev_id: u16) -> Result<OwnedFd, LinkError> {
    let raw = unsafe { libc::socket(AF_BLUETOOTH, SOCK_RAW | SOCK_CLOEXEC | SOCK_NONBLOCK, BTPROTO_HCI) };
    os_check(raw < 0, "HCI socket")?;
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: HCI_CHANNEL_RAW,
    };
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            (&addr as *const SockaddrHci).cast::<sockaddr>(),
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };
    os_check(ret < 0, "HCI bind")?;
    Ok(fd)
}

/// Only LE meta events reach the listening socket.
fn restrict_to_le_events(fd: &OwnedFd) -> Result<(), LinkError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_HCI,
            HCI_FILTER,
            (&filter as *const HciFilter).cast::<c_void>(),
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };
    os_check(ret < 0, "HCI filter")
}

fn send_command(fd: &OwnedFd, packet: &[u8]) -> Result<(), LinkError> {
    let ret = unsafe { libc::write(fd.as_raw_fd(), packet.as_ptr().cast::<c_void>(), packet.len()) };
    os_check(ret < 0, "HCI command")
}

fn set_scan_enabled(fd: &OwnedFd, enabled: bool) -> Result<(), LinkError> {
    // duplicates are not filtered, the broadcast adapter does that itself
    let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[u8::from(enabled), 0x00]);
    send_command(fd, &packet)
}

fn configure_le_scan(fd: &OwnedFd) -> Result<(), LinkError> {
    // 10 ms interval and window
    let params = scan_parameters(LE_SCAN_ACTIVE, 0x0010, 0x0010);
    let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, &params);
    send_command(fd, &packet)?;
    set_scan_enabled(fd, true)
}

/// Parse the first report of an LE advertising report event.
fn parse_advertising_report(data: &[u8]) -> Option<ScannedDeviceInfo> {
    // packet type, event code, parameter length, subevent
    let report = data.get(4..)?;

    let num_reports = *report.first()?;
    if num_reports == 0 {
        return None;
    }

    // num_reports(1) + event_type(1) + addr_type(1) + address(6)
    let mut addr = [0u8; 6];
    addr.copy_from_slice(report.get(3..9)?);
    addr.reverse(); // HCI uses little-endian address

    let data_len = *report.get(9)? as usize;
    let ad_data = report.get(10..10 + data_len)?;
    let rssi = report.get(10 + data_len).map_or(0, |b| i16::from(*b as i8));

    let mut info = ScannedDeviceInfo::new(MacAddress(addr));
    info.rssi = rssi;
    info.absorb_ad_structures(ad_data);
    Some(info)
}

/// Decode one raw event, if it is an LE advertising report.
fn decode_event(packet: &[u8]) -> Option<ScannedDeviceInfo> {
    match packet {
        [HCI_EVENT_PKT, EVT_LE_META_EVENT, _, EVT_LE_ADVERTISING_REPORT, ..] => parse_advertising_report(packet),
        _ => None,
    }
}

fn read_raw(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    let ret = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast::<c_void>(), buf.len()) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Forward accepted reports until the receiver goes away or the socket fails.
async fn pump(events: AsyncFd<OwnedFd>, filter: ScanFilter, tx: mpsc::Sender<ScannedDeviceInfo>) {
    // largest HCI event
    let mut buf = [0u8; 258];
    loop {
        let mut guard = tokio::select! {
            ready = events.readable() => match ready {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(error = %e, "HCI socket not readable");
                    return;
                }
            },
            _ = tx.closed() => return,
        };

        // drain what is queued before waiting again
        loop {
            let n = match guard.try_io(|fd| read_raw(fd.get_ref(), &mut buf)) {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!(error = %e, "HCI read failed");
                    return;
                }
                Err(_would_block) => break,
            };
            if let Some(info) = decode_event(&buf[..n])
                && filter.accepts(&info)
                && tx.send(info).await.is_err()
            {
                return;
            }
        }
    }
}

/// Passive listener on one HCI device.
#[derive(Debug, Clone, Copy)]
pub struct HciScanner {
    dev_id: u16,
}

impl HciScanner {
    pub fn new(dev_id: u16) -> Self {
        Self { dev_id }
    }
}

impl AdvertisementSource for HciScanner {
    fn scan(&self, filter: ScanFilter) -> LinkFuture<'_, mpsc::Receiver<ScannedDeviceInfo>> {
        Box::pin(async move {
            let fd = hci_socket(self.dev_id)?;
            restrict_to_le_events(&fd)?;

            // commands go out on their own socket
            let cmd_fd = hci_socket(self.dev_id)?;
            configure_le_scan(&cmd_fd)?;

            let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);
            let events = AsyncFd::new(fd)?;
            let dev_id = self.dev_id;

            tokio::spawn(async move {
                pump(events, filter, tx).await;
                if let Err(e) = set_scan_enabled(&cmd_fd, false) {
                    debug!(error = %e, "could not disable LE scan");
                }
                debug!(dev_id, "HCI scan stopped");
            });

            Ok(rx)
        })
    }
}
