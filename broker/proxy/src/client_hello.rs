//! Extracts the server name from a TLS ClientHello without consuming it.

/// Upper bound on the bytes buffered while waiting for a full ClientHello.
pub(crate) const MAX_HELLO_LEN: usize = 5 + (1 << 14);

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Parsed {
    /// More bytes are needed.
    Incomplete,

    /// The stream does not start with a ClientHello.
    NotTls,

    /// A complete ClientHello, with its `server_name` if any.
    Hello(Option<String>),
}

struct Cursor<'a>(&'a [u8]);

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.0.len() < n {
            return None;
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<usize> {
        self.take(2).map(|b| usize::from(u16::from_be_bytes([b[0], b[1]])))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| (usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2]))
    }

    fn vec8(&mut self) -> Option<&'a [u8]> {
        let n = usize::from(self.u8()?);
        self.take(n)
    }

    fn vec16(&mut self) -> Option<&'a [u8]> {
        let n = self.u16()?;
        self.take(n)
    }
}

const CONTENT_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: usize = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

pub(crate) fn parse(buf: &[u8]) -> Parsed {
    let mut record = Cursor(buf);
    let header = match record.take(5) {
        Some(h) => h,
        None if !buf.is_empty() && buf[0] != CONTENT_HANDSHAKE => return Parsed::NotTls,
        None => return Parsed::Incomplete,
    };
    if header[0] != CONTENT_HANDSHAKE || header[1] != 0x03 {
        return Parsed::NotTls;
    }
    let len = usize::from(u16::from_be_bytes([header[3], header[4]]));
    let Some(fragment) = record.take(len) else {
        return Parsed::Incomplete;
    };

    match hello(fragment) {
        Some(name) => Parsed::Hello(name),
        None => Parsed::NotTls,
    }
}

/// Parses a handshake fragment. Returns `None` when it isn't a well-formed
/// ClientHello contained in a single record.
fn hello(fragment: &[u8]) -> Option<Option<String>> {
    let mut hs = Cursor(fragment);
    if hs.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let len = hs.u24()?;
    let mut body = Cursor(hs.take(len)?);

    body.take(2)?; // legacy_version
    body.take(32)?; // random
    body.vec8()?; // legacy_session_id
    body.vec16()?; // cipher_suites
    body.vec8()?; // legacy_compression_methods
    if body.0.is_empty() {
        return Some(None);
    }

    let mut exts = Cursor(body.vec16()?);
    while !exts.0.is_empty() {
        let ty = exts.u16()?;
        let data = exts.vec16()?;
        if ty != EXT_SERVER_NAME {
            continue;
        }
        let mut list = Cursor(data);
        let mut names = Cursor(list.vec16()?);
        while !names.0.is_empty() {
            let kind = names.u8()?;
            let name = names.vec16()?;
            if kind == NAME_TYPE_HOST {
                return Some(std::str::from_utf8(name).ok().map(str::to_ascii_lowercase));
            }
        }
        return Some(None);
    }
    Some(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::ServerName;
    use std::sync::Arc;
    use tunnel_broker_tunnel::tls;

    fn client_hello(name: &str) -> Vec<u8> {
        let config = tls::insecure_client_config(&[b"h2"]).unwrap();
        let name = ServerName::try_from(name.to_string()).unwrap();
        let mut conn = rustls::ClientConnection::new(Arc::clone(&config), name).unwrap();
        let mut buf = Vec::new();
        conn.write_tls(&mut buf).unwrap();
        buf
    }

    #[test]
    fn finds_server_name() {
        let hello = client_hello("Inner.Example.Com");
        assert_eq!(
            parse(&hello),
            Parsed::Hello(Some("inner.example.com".to_string()))
        );
    }

    #[test]
    fn ip_addresses_have_no_server_name() {
        let hello = client_hello("127.0.0.1");
        assert_eq!(parse(&hello), Parsed::Hello(None));
    }

    #[test]
    fn waits_for_whole_record() {
        let hello = client_hello("inner.example.com");
        for n in [0, 1, 4, 5, hello.len() - 1] {
            assert_eq!(parse(&hello[..n]), Parsed::Incomplete, "prefix of {n} bytes");
        }
    }

    #[test]
    fn rejects_other_protocols() {
        assert_eq!(parse(b"GET / HTTP/1.1\r\n"), Parsed::NotTls);
        assert_eq!(parse(b"G"), Parsed::NotTls);
        assert_eq!(parse(&[0x16, 0x03, 0x01, 0x00, 0x02, 0x02, 0x00]), Parsed::NotTls);
    }
}
