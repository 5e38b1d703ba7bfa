//! Kernel socket statistics readers
//!
//! One `getsockopt`-family call per platform, filling the raw layout from
//! [`crate::net::tcpinfo`] and handing back both the raw snapshot and its
//! normalized form. The call is made against a live, connected socket
//! after the transfer of interest has completed.

use tokio::net::TcpStream;

use super::tcpinfo::{PlatformTcpInfo, TcpInfo};

/// Errors from the platform statistics syscall
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockoptError {
    /// No live socket to interrogate (connection never established or
    /// already closed)
    InvalidSocket,
    /// The syscall itself failed; carries the OS error number
    SyscallFailed(i32),
    /// The socket family or platform has no statistics interface
    Unsupported,
}

impl std::fmt::Display for SockoptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SockoptError::InvalidSocket => write!(f, "socket is not connected"),
            SockoptError::SyscallFailed(errno) => {
                write!(f, "tcp info syscall failed, errno={}", errno)
            }
            SockoptError::Unsupported => write!(f, "tcp info not supported here"),
        }
    }
}

impl std::error::Error for SockoptError {}

/// Read transport statistics from a live TCP socket
pub fn tcp_info(sock: &TcpStream) -> Result<(TcpInfo, PlatformTcpInfo), SockoptError> {
    let raw = read_platform(sock)?;
    Ok((raw.normalize(), raw))
}

#[cfg(target_os = "linux")]
fn read_platform(sock: &TcpStream) -> Result<PlatformTcpInfo, SockoptError> {
    use std::os::unix::io::AsRawFd;

    use super::tcpinfo::LinuxTcpInfo;

    let fd = sock.as_raw_fd();
    if fd < 0 {
        return Err(SockoptError::InvalidSocket);
    }

    let mut info = LinuxTcpInfo::default();
    let mut len = std::mem::size_of::<LinuxTcpInfo>() as libc::socklen_t;
    // SAFETY: `info` is a plain repr(C) buffer of at least `len` bytes and
    // the kernel writes no more than `len` into it.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_TCP,
            libc::TCP_INFO,
            &mut info as *mut LinuxTcpInfo as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(SockoptError::SyscallFailed(
            std::io::Error::last_os_error().raw_os_error().unwrap_or(rc),
        ));
    }
    Ok(PlatformTcpInfo::Linux(info))
}

#[cfg(target_os = "macos")]
fn read_platform(sock: &TcpStream) -> Result<PlatformTcpInfo, SockoptError> {
    use std::os::unix::io::AsRawFd;

    use super::tcpinfo::DarwinTcpInfo;

    // xnu's private getsockopt pair; not exported by libc
    const IPPROTO_TCP: libc::c_int = 6;
    const TCP_CONNECTION_INFO: libc::c_int = 0x106;

    let fd = sock.as_raw_fd();
    if fd < 0 {
        return Err(SockoptError::InvalidSocket);
    }

    let mut info = DarwinTcpInfo::default();
    let mut len = std::mem::size_of::<DarwinTcpInfo>() as libc::socklen_t;
    // SAFETY: `info` is a plain repr(C) buffer of at least `len` bytes and
    // the kernel writes no more than `len` into it.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            IPPROTO_TCP,
            TCP_CONNECTION_INFO,
            &mut info as *mut DarwinTcpInfo as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(SockoptError::SyscallFailed(
            std::io::Error::last_os_error().raw_os_error().unwrap_or(rc),
        ));
    }
    Ok(PlatformTcpInfo::Darwin(info))
}

#[cfg(target_os = "windows")]
fn read_platform(sock: &TcpStream) -> Result<PlatformTcpInfo, SockoptError> {
    use std::net::SocketAddr;

    use windows_sys::Win32::NetworkManagement::IpHelper::{
        GetPerTcpConnectionEStats, TcpConnectionEstatsPath, MIB_TCPROW_LH,
    };

    use super::tcpinfo::WindowsTcpInfo;

    let (local, remote) = match (sock.local_addr(), sock.peer_addr()) {
        (Ok(l), Ok(r)) => (l, r),
        _ => return Err(SockoptError::InvalidSocket),
    };
    let (SocketAddr::V4(local), SocketAddr::V4(remote)) = (local, remote) else {
        // the v4 row type cannot describe an IPv6 connection
        return Err(SockoptError::Unsupported);
    };

    // SAFETY: MIB_TCPROW_LH is plain data; zeroed is a valid bit pattern.
    let mut row: MIB_TCPROW_LH = unsafe { std::mem::zeroed() };
    row.dwLocalAddr = u32::from_ne_bytes(local.ip().octets());
    row.dwLocalPort = u32::from(local.port().to_be());
    row.dwRemoteAddr = u32::from_ne_bytes(remote.ip().octets());
    row.dwRemotePort = u32::from(remote.port().to_be());

    let mut rod = WindowsTcpInfo::default();
    // SAFETY: `rod` is a repr(C) mirror of TCP_ESTATS_PATH_ROD_v0 and the
    // API writes at most `rod_size` bytes into it.
    let rc = unsafe {
        GetPerTcpConnectionEStats(
            &row,
            TcpConnectionEstatsPath,
            std::ptr::null_mut(),
            0,
            0,
            std::ptr::null_mut(),
            0,
            0,
            &mut rod as *mut WindowsTcpInfo as *mut u8,
            0,
            std::mem::size_of::<WindowsTcpInfo>() as u32,
        )
    };
    if rc != 0 {
        return Err(SockoptError::SyscallFailed(rc as i32));
    }
    Ok(PlatformTcpInfo::Windows(rod))
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn read_platform(_sock: &TcpStream) -> Result<PlatformTcpInfo, SockoptError> {
    Err(SockoptError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_info_on_live_loopback_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let client = TcpStream::connect(addr).await.unwrap();
        let (_server, _) = accept.await.unwrap();

        match tcp_info(&client) {
            Ok((info, raw)) => {
                // loopback: no retransmits expected on a fresh connection
                assert_eq!(info.retransmit_packets, 0);
                assert_eq!(info, raw.normalize());
            }
            // platforms without the interface still take the typed path
            Err(SockoptError::Unsupported) => {}
            Err(e) => panic!("unexpected sockopt failure: {}", e),
        }
    }
}
