//! MPTCP subflow telemetry source
//!
//! [`SubflowTelemetry`] is the read side of the sampling loop. On Linux,
//! [`MptcpSockopt`] answers both queries with `getsockopt(SOL_MPTCP, ..)`:
//!
//! - `MPTCP_FULL_INFO` (Linux 6.5+) returns each subflow's kernel id with
//!   its `struct tcp_info` and local/remote `sockaddr` pair in one call
//! - on older kernels `MPTCP_TCPINFO` and `MPTCP_SUBFLOW_ADDRS` are read
//!   back to back and ids are assigned per address pair
//!
//! Either way an id stays with its subflow for the life of the socket; it
//! never shifts to another subflow when an earlier one closes.

use crate::error::Result;
use crate::types::{SocketHandle, SubflowAddrs, SubflowStats};

/// Source of per-subflow statistics and addresses for a socket
///
/// Implementations are pure queries: no caching between calls.
pub trait SubflowTelemetry: Send + Sync {
    /// Current statistics of every active subflow (may be empty)
    fn subflow_stats(&self, handle: SocketHandle) -> Result<Vec<SubflowStats>>;

    /// Endpoint address pair of every active subflow
    fn subflow_addrs(&self, handle: SocketHandle) -> Result<Vec<SubflowAddrs>>;
}

#[cfg(target_os = "linux")]
mod linux {
    use super::SubflowTelemetry;
    use crate::error::{PerflogError, Result};
    use crate::types::{FeatureValue, SocketHandle, SubflowAddrs, SubflowId, SubflowStats};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::io;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tracing::{debug, trace, warn};

    /// `SOL_MPTCP` from linux/socket.h
    const SOL_MPTCP: libc::c_int = 284;
    /// `MPTCP_TCPINFO` from linux/mptcp.h
    const MPTCP_TCPINFO: libc::c_int = 2;
    /// `MPTCP_SUBFLOW_ADDRS` from linux/mptcp.h
    const MPTCP_SUBFLOW_ADDRS: libc::c_int = 3;
    /// `MPTCP_FULL_INFO` from linux/mptcp.h (Linux 6.5+)
    const MPTCP_FULL_INFO: libc::c_int = 4;

    /// `struct mptcp_subflow_data`: four u32 fields
    const SUBFLOW_DATA_HEADER_LEN: usize = 16;
    /// `struct tcp_info` up to `tcpi_snd_wnd`
    const TCP_INFO_LEN: usize = 232;
    /// `struct mptcp_subflow_addrs`: two `__kernel_sockaddr_storage` unions
    const SUBFLOW_ADDRS_LEN: usize = 256;
    const SOCKADDR_STORAGE_LEN: usize = 128;

    /// `struct mptcp_full_info` up to (excluding) the embedded `mptcp_info`
    const FULL_INFO_HEADER_LEN: usize = 40;
    /// Room left for the embedded `struct mptcp_info`
    const MPTCP_INFO_RESERVE: usize = 256;
    /// `struct mptcp_subflow_info`: u32 id, then the address pair at pointer
    /// alignment
    const SUBFLOW_INFO_ADDRS_OFFSET: usize = std::mem::align_of::<*const libc::c_void>();
    const SUBFLOW_INFO_LEN: usize = SUBFLOW_INFO_ADDRS_OFFSET + SUBFLOW_ADDRS_LEN;

    /// Initial reply capacity in subflows; grown when the kernel reports more
    const INITIAL_SUBFLOW_CAPACITY: usize = 8;
    const MAX_SUBFLOW_CAPACITY: usize = 256;

    /// Legacy snapshots retried while the subflow list changes mid-read
    const LEGACY_SNAPSHOT_ATTEMPTS: usize = 3;

    #[derive(Clone, Copy)]
    enum Width {
        U8,
        U32,
        U64,
    }

    /// `struct tcp_info` layout (linux/tcp.h), excluding the wscale bitfield byte
    const TCP_INFO_FIELDS: &[(&str, usize, Width)] = &[
        ("tcpi_state", 0, Width::U8),
        ("tcpi_ca_state", 1, Width::U8),
        ("tcpi_retransmits", 2, Width::U8),
        ("tcpi_probes", 3, Width::U8),
        ("tcpi_backoff", 4, Width::U8),
        ("tcpi_options", 5, Width::U8),
        ("tcpi_rto", 8, Width::U32),
        ("tcpi_ato", 12, Width::U32),
        ("tcpi_snd_mss", 16, Width::U32),
        ("tcpi_rcv_mss", 20, Width::U32),
        ("tcpi_unacked", 24, Width::U32),
        ("tcpi_sacked", 28, Width::U32),
        ("tcpi_lost", 32, Width::U32),
        ("tcpi_retrans", 36, Width::U32),
        ("tcpi_fackets", 40, Width::U32),
        ("tcpi_last_data_sent", 44, Width::U32),
        ("tcpi_last_ack_sent", 48, Width::U32),
        ("tcpi_last_data_recv", 52, Width::U32),
        ("tcpi_last_ack_recv", 56, Width::U32),
        ("tcpi_pmtu", 60, Width::U32),
        ("tcpi_rcv_ssthresh", 64, Width::U32),
        ("tcpi_rtt", 68, Width::U32),
        ("tcpi_rttvar", 72, Width::U32),
        ("tcpi_snd_ssthresh", 76, Width::U32),
        ("tcpi_snd_cwnd", 80, Width::U32),
        ("tcpi_advmss", 84, Width::U32),
        ("tcpi_reordering", 88, Width::U32),
        ("tcpi_rcv_rtt", 92, Width::U32),
        ("tcpi_rcv_space", 96, Width::U32),
        ("tcpi_total_retrans", 100, Width::U32),
        ("tcpi_pacing_rate", 104, Width::U64),
        ("tcpi_max_pacing_rate", 112, Width::U64),
        ("tcpi_bytes_acked", 120, Width::U64),
        ("tcpi_bytes_received", 128, Width::U64),
        ("tcpi_segs_out", 136, Width::U32),
        ("tcpi_segs_in", 140, Width::U32),
        ("tcpi_notsent_bytes", 144, Width::U32),
        ("tcpi_min_rtt", 148, Width::U32),
        ("tcpi_data_segs_in", 152, Width::U32),
        ("tcpi_data_segs_out", 156, Width::U32),
        ("tcpi_delivery_rate", 160, Width::U64),
        ("tcpi_busy_time", 168, Width::U64),
        ("tcpi_rwnd_limited", 176, Width::U64),
        ("tcpi_sndbuf_limited", 184, Width::U64),
        ("tcpi_delivered", 192, Width::U32),
        ("tcpi_delivered_ce", 196, Width::U32),
        ("tcpi_bytes_sent", 200, Width::U64),
        ("tcpi_bytes_retrans", 208, Width::U64),
        ("tcpi_dsack_dups", 216, Width::U32),
        ("tcpi_reord_seen", 220, Width::U32),
        ("tcpi_rcv_ooopack", 224, Width::U32),
        ("tcpi_snd_wnd", 228, Width::U32),
    ];

    /// Offset of the `tcpi_snd_wscale:4, tcpi_rcv_wscale:4` byte
    const WSCALE_OFFSET: usize = 6;

    /// Reads MPTCP subflow telemetry with `getsockopt(SOL_MPTCP, ..)`
    ///
    /// Subflow ids are the kernel's own subflow ids from `MPTCP_FULL_INFO`.
    /// Kernels without it get ids assigned per local/remote address pair, so
    /// an id never moves to another subflow when one closes.
    #[derive(Debug, Default)]
    pub struct MptcpSockopt {
        full_info_unsupported: AtomicBool,
        address_ids: Mutex<AddressIds>,
    }

    impl MptcpSockopt {
        /// Create a new reader
        pub fn new() -> Self {
            Self::default()
        }

        /// One consistent view of every subflow: stats and addresses together
        fn snapshot(&self, handle: SocketHandle) -> Result<Vec<SubflowSnapshot>> {
            if !self.full_info_unsupported.load(Ordering::Relaxed) {
                match query_full_info(handle)? {
                    Some(snapshot) => return Ok(snapshot),
                    None => {
                        debug!(fd = handle, "MPTCP_FULL_INFO unsupported, keying ids by address");
                        self.full_info_unsupported.store(true, Ordering::Relaxed);
                    }
                }
            }
            self.legacy_snapshot(handle)
        }

        /// Pair `MPTCP_TCPINFO` with `MPTCP_SUBFLOW_ADDRS` by position
        ///
        /// The address list is read before and after the statistics; the
        /// read is retried until both address reads agree.
        fn legacy_snapshot(&self, handle: SocketHandle) -> Result<Vec<SubflowSnapshot>> {
            for _ in 0..LEGACY_SNAPSHOT_ATTEMPTS {
                let before = query_addr_pairs(handle)?;
                let tcp = query_subflow_data(handle, MPTCP_TCPINFO, TCP_INFO_LEN)?;
                let after = query_addr_pairs(handle)?;
                if before != after || before.len() != tcp.layout.count {
                    trace!(fd = handle, "Subflow list changed during read, retrying");
                    continue;
                }

                let mut ids = self.address_ids.lock();
                return Ok(before
                    .into_iter()
                    .zip(tcp.records())
                    .filter_map(|(pair, record)| {
                        let Some((local, remote)) = pair else {
                            warn!(fd = handle, "Skipping subflow with unsupported address family");
                            return None;
                        };
                        let id = ids.id_for(handle, local, remote);
                        Some(SubflowSnapshot {
                            stats: parse_tcp_info(id, record),
                            addrs: Some(SubflowAddrs::new(id, local, remote)),
                        })
                    })
                    .collect());
            }
            Err(PerflogError::telemetry(format!(
                "subflow list of fd {} kept changing across {} reads",
                handle, LEGACY_SNAPSHOT_ATTEMPTS
            )))
        }
    }

    impl SubflowTelemetry for MptcpSockopt {
        fn subflow_stats(&self, handle: SocketHandle) -> Result<Vec<SubflowStats>> {
            Ok(self
                .snapshot(handle)?
                .into_iter()
                .map(|subflow| subflow.stats)
                .collect())
        }

        fn subflow_addrs(&self, handle: SocketHandle) -> Result<Vec<SubflowAddrs>> {
            Ok(self
                .snapshot(handle)?
                .into_iter()
                .filter_map(|subflow| subflow.addrs)
                .collect())
        }
    }

    /// Statistics and addresses of one subflow from the same read
    #[derive(Debug)]
    struct SubflowSnapshot {
        stats: SubflowStats,
        addrs: Option<SubflowAddrs>,
    }

    /// Subflow ids keyed by socket and address pair
    #[derive(Debug, Default)]
    struct AddressIds {
        last: SubflowId,
        ids: HashMap<(SocketHandle, SocketAddr, SocketAddr), SubflowId>,
    }

    impl AddressIds {
        fn id_for(
            &mut self,
            handle: SocketHandle,
            local: SocketAddr,
            remote: SocketAddr,
        ) -> SubflowId {
            let key = (handle, local, remote);
            if let Some(id) = self.ids.get(&key) {
                return *id;
            }
            self.last = self.last.saturating_add(1);
            self.ids.insert(key, self.last);
            self.last
        }
    }

    /// Buffer sizing decision for a kernel reply
    #[derive(Debug, PartialEq, Eq)]
    enum Sizing<T> {
        /// Retry with room for this many subflows
        Grow(usize),
        /// The reply holds every subflow we have room for
        Ready(T),
    }

    /// Capacity for the next attempt, or `None` if the reply is final
    fn next_capacity(num_subflows: usize, capacity: usize) -> Option<usize> {
        if num_subflows <= capacity || capacity >= MAX_SUBFLOW_CAPACITY {
            return None;
        }
        Some(num_subflows.max(capacity * 2).min(MAX_SUBFLOW_CAPACITY))
    }

    /// Record layout of a `mptcp_subflow_data` reply
    #[derive(Debug, PartialEq, Eq)]
    struct DataLayout {
        header_len: usize,
        stride: usize,
        count: usize,
    }

    /// Decide from a `mptcp_subflow_data` header whether the reply is complete
    fn plan_subflow_data(
        buf: &[u8],
        returned: usize,
        capacity: usize,
    ) -> Result<Sizing<DataLayout>> {
        let header_len = read_u32(buf, 0) as usize;
        let num_subflows = read_u32(buf, 4) as usize;
        let stride = read_u32(buf, 12) as usize;
        if header_len < SUBFLOW_DATA_HEADER_LEN || stride == 0 {
            return Err(PerflogError::telemetry(format!(
                "malformed mptcp_subflow_data reply (header {}, record {})",
                header_len, stride
            )));
        }

        let fits = returned.min(buf.len()).saturating_sub(header_len) / stride;
        if num_subflows > fits {
            if let Some(next) = next_capacity(num_subflows, capacity) {
                return Ok(Sizing::Grow(next));
            }
        }
        Ok(Sizing::Ready(DataLayout {
            header_len,
            stride,
            count: num_subflows.min(fits),
        }))
    }

    /// Record layout of a `mptcp_full_info` reply
    #[derive(Debug, PartialEq, Eq)]
    struct FullInfoLayout {
        tcp_stride: usize,
        info_stride: usize,
        count: usize,
    }

    /// Decide from a `mptcp_full_info` header whether the arrays hold every subflow
    fn plan_full_info(header: &[u8], capacity: usize) -> Result<Sizing<FullInfoLayout>> {
        let tcp_stride = read_u32(header, 4) as usize;
        let info_stride = read_u32(header, 12) as usize;
        let num_subflows = read_u32(header, 16) as usize;
        if tcp_stride == 0 || info_stride < 4 {
            return Err(PerflogError::telemetry(format!(
                "malformed mptcp_full_info reply (tcp_info {}, subflow_info {})",
                tcp_stride, info_stride
            )));
        }

        if let Some(next) = next_capacity(num_subflows, capacity) {
            return Ok(Sizing::Grow(next));
        }
        Ok(Sizing::Ready(FullInfoLayout {
            tcp_stride,
            info_stride,
            count: num_subflows.min(capacity),
        }))
    }

    /// Reply of one `mptcp_subflow_data` query
    struct SubflowDataReply {
        buf: Vec<u8>,
        layout: DataLayout,
    }

    impl SubflowDataReply {
        fn records(&self) -> impl Iterator<Item = &[u8]> {
            self.buf
                .get(self.layout.header_len..)
                .unwrap_or_default()
                .chunks_exact(self.layout.stride)
                .take(self.layout.count)
        }
    }

    fn read_u32(buf: &[u8], offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[offset..offset + 4]);
        u32::from_ne_bytes(bytes)
    }

    fn read_u64(buf: &[u8], offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[offset..offset + 8]);
        u64::from_ne_bytes(bytes)
    }

    fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    /// `getsockopt(fd, SOL_MPTCP, optname, buf)`; returns the reply length
    fn mptcp_getsockopt(
        handle: SocketHandle,
        optname: libc::c_int,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        let mut optlen = buf.len() as libc::socklen_t;
        // SAFETY: buf is valid for optlen bytes and outlives the call.
        let ret = unsafe {
            libc::getsockopt(
                handle,
                SOL_MPTCP,
                optname,
                buf.as_mut_ptr().cast::<libc::c_void>(),
                &mut optlen,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(optlen as usize)
    }

    fn sockopt_error(handle: SocketHandle, optname: libc::c_int, e: io::Error) -> PerflogError {
        PerflogError::telemetry(format!(
            "getsockopt(SOL_MPTCP, {}) on fd {} failed: {}",
            optname, handle, e
        ))
    }

    /// Issue a `MPTCP_FULL_INFO` getsockopt; `None` if the kernel lacks it
    fn query_full_info(handle: SocketHandle) -> Result<Option<Vec<SubflowSnapshot>>> {
        let mut capacity = INITIAL_SUBFLOW_CAPACITY;

        loop {
            let mut info = vec![0u8; capacity * SUBFLOW_INFO_LEN];
            let mut tcp = vec![0u8; capacity * TCP_INFO_LEN];
            let mut header = vec![0u8; FULL_INFO_HEADER_LEN + MPTCP_INFO_RESERVE];
            write_u32(&mut header, 4, TCP_INFO_LEN as u32);
            write_u32(&mut header, 12, SUBFLOW_INFO_LEN as u32);
            write_u32(&mut header, 20, capacity as u32);
            // The kernel writes the arrays through these user pointers
            header[24..32].copy_from_slice(&(info.as_mut_ptr() as u64).to_ne_bytes());
            header[32..40].copy_from_slice(&(tcp.as_mut_ptr() as u64).to_ne_bytes());

            match mptcp_getsockopt(handle, MPTCP_FULL_INFO, &mut header) {
                Ok(_) => {}
                Err(e)
                    if matches!(e.raw_os_error(), Some(libc::EOPNOTSUPP | libc::ENOPROTOOPT)) =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(sockopt_error(handle, MPTCP_FULL_INFO, e)),
            }

            match plan_full_info(&header, capacity)? {
                Sizing::Grow(next) => {
                    trace!(capacity, next, "Growing subflow info arrays");
                    capacity = next;
                }
                Sizing::Ready(layout) => return Ok(Some(parse_full_info(&layout, &info, &tcp))),
            }
        }
    }

    /// Decode the subflow info and tcp_info arrays of a full info reply
    fn parse_full_info(layout: &FullInfoLayout, info: &[u8], tcp: &[u8]) -> Vec<SubflowSnapshot> {
        info.chunks_exact(layout.info_stride)
            .zip(tcp.chunks_exact(layout.tcp_stride))
            .take(layout.count)
            .map(|(info_record, tcp_record)| {
                let id = read_u32(info_record, 0);
                let addrs = info_record
                    .get(SUBFLOW_INFO_ADDRS_OFFSET..)
                    .and_then(parse_addr_pair)
                    .map(|(local, remote)| SubflowAddrs::new(id, local, remote));
                if addrs.is_none() {
                    warn!(subflow_id = id, "Subflow with unsupported address family");
                }
                SubflowSnapshot {
                    stats: parse_tcp_info(id, tcp_record),
                    addrs,
                }
            })
            .collect()
    }

    /// Issue a `mptcp_subflow_data` getsockopt, growing the buffer until every
    /// subflow fits
    fn query_subflow_data(
        handle: SocketHandle,
        optname: libc::c_int,
        record_len: usize,
    ) -> Result<SubflowDataReply> {
        let mut capacity = INITIAL_SUBFLOW_CAPACITY;

        loop {
            let mut buf = vec![0u8; SUBFLOW_DATA_HEADER_LEN + capacity * record_len];
            // size_subflow_data, num_subflows (0), size_kernel (0), size_user
            write_u32(&mut buf, 0, SUBFLOW_DATA_HEADER_LEN as u32);
            write_u32(&mut buf, 12, record_len as u32);

            let returned = mptcp_getsockopt(handle, optname, &mut buf)
                .map_err(|e| sockopt_error(handle, optname, e))?;

            match plan_subflow_data(&buf, returned, capacity)? {
                Sizing::Grow(next) => {
                    trace!(capacity, next, "Growing subflow reply buffer");
                    capacity = next;
                }
                Sizing::Ready(layout) => {
                    buf.truncate(returned.min(buf.len()));
                    return Ok(SubflowDataReply { buf, layout });
                }
            }
        }
    }

    /// Address pairs in kernel order; `None` for unsupported families
    fn query_addr_pairs(handle: SocketHandle) -> Result<Vec<Option<(SocketAddr, SocketAddr)>>> {
        let reply = query_subflow_data(handle, MPTCP_SUBFLOW_ADDRS, SUBFLOW_ADDRS_LEN)?;
        Ok(reply.records().map(parse_addr_pair).collect())
    }

    /// Decode the `tcp_info` fields the kernel filled in
    fn parse_tcp_info(id: SubflowId, record: &[u8]) -> SubflowStats {
        let mut stats = SubflowStats::new(id).with_feature("id", id);

        for &(name, offset, width) in TCP_INFO_FIELDS {
            let value: Option<FeatureValue> = match width {
                Width::U8 => record.get(offset).map(|v| FeatureValue::from(*v)),
                Width::U32 if offset + 4 <= record.len() => {
                    Some(FeatureValue::from(read_u32(record, offset)))
                }
                Width::U64 if offset + 8 <= record.len() => {
                    Some(FeatureValue::from(read_u64(record, offset)))
                }
                _ => None,
            };
            if let Some(value) = value {
                stats.features.insert(name.to_string(), value);
            }
        }

        if let Some(wscale) = record.get(WSCALE_OFFSET) {
            stats
                .features
                .insert("tcpi_snd_wscale".to_string(), FeatureValue::from(wscale & 0x0f));
            stats
                .features
                .insert("tcpi_rcv_wscale".to_string(), FeatureValue::from(wscale >> 4));
        }

        stats
    }

    /// Decode a `struct mptcp_subflow_addrs` (local, then remote)
    fn parse_addr_pair(record: &[u8]) -> Option<(SocketAddr, SocketAddr)> {
        let local = parse_sockaddr(record.get(..SOCKADDR_STORAGE_LEN)?)?;
        let remote = parse_sockaddr(record.get(SOCKADDR_STORAGE_LEN..)?)?;
        Some((local, remote))
    }

    /// Decode a `sockaddr_in`/`sockaddr_in6` out of a sockaddr storage union
    fn parse_sockaddr(storage: &[u8]) -> Option<SocketAddr> {
        if storage.len() < 2 {
            return None;
        }
        let family = libc::c_int::from(u16::from_ne_bytes([storage[0], storage[1]]));

        if family == libc::AF_INET && storage.len() >= 8 {
            let port = u16::from_be_bytes([storage[2], storage[3]]);
            let ip = Ipv4Addr::new(storage[4], storage[5], storage[6], storage[7]);
            Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        } else if family == libc::AF_INET6 && storage.len() >= 28 {
            let port = u16::from_be_bytes([storage[2], storage[3]]);
            let flowinfo = u32::from_be_bytes([storage[4], storage[5], storage[6], storage[7]]);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&storage[8..24]);
            let scope_id = read_u32(storage, 24);
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                flowinfo,
                scope_id,
            )))
        } else {
            None
        }
    }

}

#[cfg(not(target_os = "linux"))]
mod other {
    use super::SubflowTelemetry;
    use crate::error::{PerflogError, Result};
    use crate::types::{SocketHandle, SubflowAddrs, SubflowStats};

    /// MPTCP socket options are Linux-only; every query fails elsewhere
    #[derive(Debug, Default)]
    pub struct MptcpSockopt;

    impl MptcpSockopt {
        /// Create a new reader
        pub fn new() -> Self {
            Self
        }
    }

    impl SubflowTelemetry for MptcpSockopt {
        fn subflow_stats(&self, _handle: SocketHandle) -> Result<Vec<SubflowStats>> {
            Err(PerflogError::telemetry("MPTCP telemetry requires Linux"))
        }

        fn subflow_addrs(&self, _handle: SocketHandle) -> Result<Vec<SubflowAddrs>> {
            Err(PerflogError::telemetry("MPTCP telemetry requires Linux"))
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::MptcpSockopt;
#[cfg(not(target_os = "linux"))]
pub use other::MptcpSockopt;
