//! Test fixtures for the SNI proxy.
//!
//! Builds synthetic TLS records byte by byte so that tests can exercise
//! well-formed ClientHellos as well as records with hostile length fields
//! without pulling a TLS stack into every test.

/// TLS record content type for handshake messages.
pub const HANDSHAKE: u8 = 0x16;

/// TLS record content type for application data.
pub const APPLICATION_DATA: u8 = 0x17;

/// Extension type carrying the server name list.
pub const EXT_SERVER_NAME: u16 = 0x0000;

/// Extension type used for padding (RFC 7685).
pub const EXT_PADDING: u16 = 0x0015;

/// Builder for a single-record TLS ClientHello.
///
/// Defaults produce a TLS 1.2 ClientHello carrying one cipher suite, null
/// compression and no extensions. Call [`ClientHelloBuilder::server_name`]
/// to add an SNI extension.
#[derive(Debug, Clone)]
pub struct ClientHelloBuilder {
    record_version: [u8; 2],
    session_id: Vec<u8>,
    cipher_suites: Vec<u16>,
    compression_methods: Vec<u8>,
    server_names: Option<Vec<(u8, Vec<u8>)>>,
    extensions_before: Vec<(u16, Vec<u8>)>,
    extensions_after: Vec<(u16, Vec<u8>)>,
    with_extensions: bool,
}

impl Default for ClientHelloBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientHelloBuilder {
    pub fn new() -> Self {
        Self {
            record_version: [0x03, 0x01],
            session_id: Vec::new(),
            cipher_suites: vec![0xc02f],
            compression_methods: vec![0x00],
            server_names: None,
            extensions_before: Vec::new(),
            extensions_after: Vec::new(),
            with_extensions: true,
        }
    }

    /// Add a host_name entry to the SNI extension.
    pub fn server_name(self, hostname: &str) -> Self {
        self.server_name_entry(0, hostname.as_bytes())
    }

    /// Add an arbitrary server name entry (type byte + payload).
    pub fn server_name_entry(mut self, name_type: u8, name: &[u8]) -> Self {
        self.server_names
            .get_or_insert_with(Vec::new)
            .push((name_type, name.to_vec()));
        self
    }

    pub fn record_version(mut self, major: u8, minor: u8) -> Self {
        self.record_version = [major, minor];
        self
    }

    pub fn session_id(mut self, session_id: &[u8]) -> Self {
        self.session_id = session_id.to_vec();
        self
    }

    pub fn cipher_suites(mut self, suites: &[u16]) -> Self {
        self.cipher_suites = suites.to_vec();
        self
    }

    pub fn compression_methods(mut self, methods: &[u8]) -> Self {
        self.compression_methods = methods.to_vec();
        self
    }

    /// Add an extension that is written before the SNI extension.
    pub fn extension_before_sni(mut self, ext_type: u16, data: &[u8]) -> Self {
        self.extensions_before.push((ext_type, data.to_vec()));
        self
    }

    /// Add an extension that is written after the SNI extension.
    pub fn extension_after_sni(mut self, ext_type: u16, data: &[u8]) -> Self {
        self.extensions_after.push((ext_type, data.to_vec()));
        self
    }

    /// Omit the extensions block entirely (pre-TLS 1.0 style hello).
    pub fn without_extensions(mut self) -> Self {
        self.with_extensions = false;
        self
    }

    /// Encode the ClientHello body (everything after the handshake header).
    pub fn build_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        // client_version TLS 1.2
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0x5a; 32]);

        body.push(self.session_id.len() as u8);
        body.extend_from_slice(&self.session_id);

        put_u16(&mut body, (self.cipher_suites.len() * 2) as u16);
        for suite in &self.cipher_suites {
            put_u16(&mut body, *suite);
        }

        body.push(self.compression_methods.len() as u8);
        body.extend_from_slice(&self.compression_methods);

        if self.with_extensions {
            let extensions = self.build_extensions();
            put_u16(&mut body, extensions.len() as u16);
            body.extend_from_slice(&extensions);
        }

        body
    }

    /// Encode the complete record: record header, handshake header, body.
    pub fn build(&self) -> Vec<u8> {
        let body = self.build_body();

        let mut handshake = Vec::with_capacity(4 + body.len());
        handshake.push(0x01);
        put_u24(&mut handshake, body.len() as u32);
        handshake.extend_from_slice(&body);

        let mut record = Vec::with_capacity(5 + handshake.len());
        record.push(HANDSHAKE);
        record.extend_from_slice(&self.record_version);
        put_u16(&mut record, handshake.len() as u16);
        record.extend_from_slice(&handshake);
        record
    }

    fn build_extensions(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (ext_type, data) in &self.extensions_before {
            put_extension(&mut out, *ext_type, data);
        }

        if let Some(entries) = &self.server_names {
            let mut list = Vec::new();
            for (name_type, name) in entries {
                list.push(*name_type);
                put_u16(&mut list, name.len() as u16);
                list.extend_from_slice(name);
            }
            let mut data = Vec::with_capacity(2 + list.len());
            put_u16(&mut data, list.len() as u16);
            data.extend_from_slice(&list);
            put_extension(&mut out, EXT_SERVER_NAME, &data);
        }

        for (ext_type, data) in &self.extensions_after {
            put_extension(&mut out, *ext_type, data);
        }
        out
    }
}

/// Wrap a payload in a TLS record header with the given content type.
pub fn raw_record(content_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(5 + payload.len());
    record.push(content_type);
    record.extend_from_slice(&[0x03, 0x01]);
    put_u16(&mut record, payload.len() as u16);
    record.extend_from_slice(payload);
    record
}

/// Offset of the session ID length byte within a record built by
/// [`ClientHelloBuilder::build`].
pub const SESSION_ID_LEN_OFFSET: usize = 5 + 4 + 2 + 32;

fn put_extension(out: &mut Vec<u8>, ext_type: u16, data: &[u8]) {
    put_u16(out, ext_type);
    put_u16(out, data.len() as u16);
    out.extend_from_slice(data);
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u24(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes()[1..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_length_matches_payload() {
        let record = ClientHelloBuilder::new().server_name("example.com").build();
        let declared = u16::from_be_bytes([record[3], record[4]]) as usize;
        assert_eq!(record.len(), 5 + declared);
        assert_eq!(record[0], HANDSHAKE);
        assert_eq!(record[5], 0x01);
    }

    #[test]
    fn test_session_id_offset() {
        let record = ClientHelloBuilder::new().session_id(&[7; 32]).build();
        assert_eq!(record[SESSION_ID_LEN_OFFSET], 32);
    }
}
