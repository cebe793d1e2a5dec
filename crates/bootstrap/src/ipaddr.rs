//! Pick the address the broker advertises in its tcp:// bind URI.
//!
//! The `tbon.interface-hint` attribute selects the method: `hostname`
//! does a forward DNS lookup on the local hostname, `default-route`
//! probes the primary route's source address, and anything else names an
//! interface directly.

use std::ffi::CStr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs, UdpSocket};

use canopy_core::Error;

pub fn local_hostname() -> Result<String, Error> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return Err(Error::from(std::io::Error::last_os_error()));
    }
    let cstr = CStr::from_bytes_until_nul(&buf)
        .map_err(|_| Error::invalid("hostname is not NUL terminated"))?;
    Ok(cstr.to_string_lossy().into_owned())
}

fn hostname_addr(ipv6: bool) -> Result<IpAddr, Error> {
    let host = local_hostname()?;
    let addrs = (host.as_str(), 0u16)
        .to_socket_addrs()
        .map_err(|err| Error::io(format!("error resolving {host}: {err}")))?;
    addrs
        .map(|sa| sa.ip())
        .find(|ip| ip.is_ipv6() == ipv6)
        .ok_or_else(|| Error::notfound(format!("no usable address for hostname {host}")))
}

/// Source address of the primary route, discovered by "connecting" a
/// datagram socket to a well-known address.  No packet is sent.
fn default_route_addr(ipv6: bool) -> Result<IpAddr, Error> {
    let (bind, probe) = if ipv6 {
        ("[::]:0", "[2001:4860:4860::8888]:9")
    } else {
        ("0.0.0.0:0", "8.8.8.8:9")
    };
    let sock = UdpSocket::bind(bind).map_err(Error::from)?;
    sock.connect(probe)
        .map_err(|err| Error::io(format!("error probing default route: {err}")))?;
    Ok(sock.local_addr().map_err(Error::from)?.ip())
}

fn interface_addr(name: &str, ipv6: bool) -> Result<IpAddr, Error> {
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(Error::from(std::io::Error::last_os_error()));
    }
    let mut found = None;
    let mut cur = ifap;
    while !cur.is_null() {
        let ifa = unsafe { &*cur };
        cur = ifa.ifa_next;
        if ifa.ifa_addr.is_null() {
            continue;
        }
        let ifname = unsafe { CStr::from_ptr(ifa.ifa_name) }.to_string_lossy();
        if ifname != name {
            continue;
        }
        let family = unsafe { (*ifa.ifa_addr).sa_family } as i32;
        if !ipv6 && family == libc::AF_INET {
            let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
            found = Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(
                sin.sin_addr.s_addr,
            ))));
            break;
        }
        if ipv6 && family == libc::AF_INET6 {
            let sin6 = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in6) };
            let addr = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            if addr.segments()[0] & 0xffc0 == 0xfe80 {
                continue; // link-local, not routable without a scope id
            }
            found = Some(IpAddr::V6(addr));
            break;
        }
    }
    unsafe { libc::freeifaddrs(ifap) };
    found.ok_or_else(|| Error::notfound(format!("no usable address on interface {name}")))
}

/// Resolve the advertised address per the interface hint.
pub fn primary_addr(hint: &str, ipv6: bool) -> Result<IpAddr, Error> {
    match hint {
        "hostname" => hostname_addr(ipv6),
        "default-route" => default_route_addr(ipv6),
        name => interface_addr(name, ipv6),
    }
}
