use std::ffi::{CStr, CString};
use std::fmt;
use std::rc::Rc;

use base_error::*;
use nix::sys::socket::{SockAddr, SockaddrLike, UnixAddr};
use value::{AbstractType, Value};

pub static SOCKET_ADDRESS_TYPE: AbstractType = AbstractType {
    name: "core/socket-address",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Datagram,
}

impl Default for SocketType {
    fn default() -> Self {
        SocketType::Stream
    }
}

/// Port of an address lookup: a number or a service name, rendered to a
/// string before resolution. For `":unix"` hosts this is the filesystem
/// path.
#[derive(Debug, Clone)]
pub enum Port {
    Number(u16),
    Name(String),
}

impl Port {
    pub(crate) fn render(&self) -> String {
        match self {
            Port::Number(n) => n.to_string(),
            Port::Name(s) => s.clone(),
        }
    }
}

impl From<u16> for Port {
    fn from(n: u16) -> Self {
        Port::Number(n)
    }
}

impl From<&str> for Port {
    fn from(s: &str) -> Self {
        Port::Name(s.to_string())
    }
}

impl From<String> for Port {
    fn from(s: String) -> Self {
        Port::Name(s)
    }
}

/// Opaque socket address: IPv4, IPv6 or a Unix path. Not serialised; it only
/// has meaning inside the process that resolved it.
#[derive(Clone)]
pub struct SocketAddress(pub(crate) SockAddr);

impl SocketAddress {
    pub fn name(&self) -> SocketName {
        socket_name(&self.0)
    }

    pub fn to_value(&self) -> Value {
        Value::abstract_of(&SOCKET_ADDRESS_TYPE, Rc::new(self.clone()))
    }

    pub fn from_value(v: &Value) -> Result<SocketAddress> {
        match v {
            Value::Abstract(a) if a.is_type(&SOCKET_ADDRESS_TYPE) => a
                .downcast::<SocketAddress>()
                .map(|addr| (*addr).clone())
                .ok_or_else(|| err_msg("corrupt socket address value")),
            _ => Err(err_msg("expected a core/socket-address")),
        }
    }
}

impl fmt::Debug for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Human form of a socket name: the host (or Unix path) plus the port for
/// families that carry one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketName {
    pub host: String,
    pub port: Option<u16>,
}

impl SocketName {
    /// `(host)` or `(host port)` as a runtime tuple.
    pub fn to_value(&self) -> Value {
        let mut elements = vec![Value::string(self.host.as_bytes())];
        if let Some(port) = self.port {
            elements.push(Value::Integer(port as i32));
        }
        Value::tuple(elements)
    }
}

impl fmt::Display for SocketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

pub(crate) fn socket_name(addr: &SockAddr) -> SocketName {
    match addr {
        SockAddr::Inet(inet) => {
            let std_addr = inet.to_std();
            SocketName {
                host: std_addr.ip().to_string(),
                port: if std_addr.port() > 0 {
                    Some(std_addr.port())
                } else {
                    None
                },
            }
        }
        SockAddr::Unix(unix) => SocketName {
            host: unix_host(unix),
            port: None,
        },
        _ => SocketName {
            host: String::new(),
            port: None,
        },
    }
}

fn unix_host(unix: &UnixAddr) -> String {
    if let Some(name) = unix.as_abstract() {
        return format!("@{}", String::from_utf8_lossy(name));
    }
    let path = unix
        .path()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let trimmed = path.trim_end_matches('\0');
    if trimmed.is_empty() {
        // Unnamed socket.
        "@".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Resolves a host/port pair to its first matching address.
pub fn address(host: &str, port: impl Into<Port>, ty: SocketType) -> Result<SocketAddress> {
    let mut all = resolve(host, &port.into().render(), ty, false)?;
    Ok(all.remove(0))
}

/// Resolves a host/port pair to every matching address, in resolver order.
pub fn addresses(host: &str, port: impl Into<Port>, ty: SocketType) -> Result<Vec<SocketAddress>> {
    resolve(host, &port.into().render(), ty, false)
}

/// Lookup through the host resolver. `":unix"` as host short-circuits to a
/// Unix-domain address built from `port` as a path; on Linux a leading `@`
/// selects the abstract namespace.
pub(crate) fn resolve(
    host: &str,
    port: &str,
    ty: SocketType,
    passive: bool,
) -> Result<Vec<SocketAddress>> {
    if host == ":unix" {
        return Ok(vec![SocketAddress(SockAddr::Unix(unix_addr(port)?))]);
    }

    let c_host = CString::new(host)?;
    let c_port = CString::new(port)?;

    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = match ty {
        SocketType::Stream => libc::SOCK_STREAM,
        SocketType::Datagram => libc::SOCK_DGRAM,
    };
    hints.ai_flags = if passive { libc::AI_PASSIVE } else { 0 };

    let mut info: *mut libc::addrinfo = std::ptr::null_mut();
    let status = unsafe { libc::getaddrinfo(c_host.as_ptr(), c_port.as_ptr(), &hints, &mut info) };
    if status != 0 {
        let detail = unsafe { CStr::from_ptr(libc::gai_strerror(status)) };
        return Err(format_err!(
            "could not get address info: {}",
            detail.to_string_lossy()
        ));
    }

    let mut out = Vec::new();
    let mut iter = info;
    while !iter.is_null() {
        let entry = unsafe { &*iter };
        if let Some(addr) = unsafe { SockAddr::from_raw(entry.ai_addr, None) } {
            out.push(SocketAddress(addr));
        }
        iter = entry.ai_next;
    }
    unsafe { libc::freeaddrinfo(info) };

    if out.is_empty() {
        return Err(err_msg("no data for given address"));
    }
    Ok(out)
}

fn unix_addr(path: &str) -> Result<UnixAddr> {
    #[cfg(target_os = "linux")]
    if let Some(name) = path.strip_prefix('@') {
        return Ok(UnixAddr::new_abstract(name.as_bytes())?);
    }
    Ok(UnixAddr::new(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_loopback() {
        let addr = address("127.0.0.1", 8080u16, SocketType::Stream).unwrap();
        let name = addr.name();
        assert_eq!(name.host, "127.0.0.1");
        assert_eq!(name.port, Some(8080));
        assert_eq!(name.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn resolves_service_names() {
        // Skipped quietly when the host has no services database.
        if let Ok(addr) = address("127.0.0.1", "http", SocketType::Stream) {
            assert_eq!(addr.name().port, Some(80));
        }
    }

    #[test]
    fn resolves_every_address() {
        let all = addresses("localhost", 53u16, SocketType::Datagram).unwrap();
        assert!(!all.is_empty());
    }

    #[test]
    fn unix_paths() {
        let addr = address(":unix", "/tmp/test.sock", SocketType::Stream).unwrap();
        let name = addr.name();
        assert_eq!(name.host, "/tmp/test.sock");
        assert_eq!(name.port, None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn abstract_namespace_round_trips() {
        let addr = address(":unix", "@abstract-name", SocketType::Stream).unwrap();
        assert_eq!(addr.name().host, "@abstract-name");
    }

    #[test]
    fn unresolvable_hosts_raise() {
        let err = address("host.invalid.", 80u16, SocketType::Stream).unwrap_err();
        assert!(err.to_string().contains("could not get address info"));
    }

    #[test]
    fn value_round_trip() {
        let addr = address("127.0.0.1", 9000u16, SocketType::Datagram).unwrap();
        let v = addr.to_value();
        let back = SocketAddress::from_value(&v).unwrap();
        assert_eq!(back.name(), addr.name());
        assert!(SocketAddress::from_value(&Value::Nil).is_err());
    }

    #[test]
    fn name_tuple_shape() {
        let name = SocketName {
            host: "10.0.0.1".to_string(),
            port: Some(5000),
        };
        assert_eq!(
            name.to_value(),
            Value::tuple(vec![Value::string("10.0.0.1"), Value::Integer(5000)])
        );
    }
}
