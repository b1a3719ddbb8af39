use zeroize::Zeroizing;

/// An administrator password held in memory only for the elevation check.
///
/// The buffer is wiped when the value is dropped. `Debug` never prints it.
pub struct Credential(Zeroizing<String>);

impl Credential {
    pub fn new(secret: String) -> Self {
        Credential(Zeroizing::new(secret))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The secret terminated by a newline, ready for the elevation program's stdin.
    pub(crate) fn stdin_payload(&self) -> Zeroizing<Vec<u8>> {
        let mut payload = Zeroizing::new(Vec::with_capacity(self.0.len() + 1));
        payload.extend_from_slice(self.0.as_bytes());
        payload.push(b'\n');
        payload
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

impl From<String> for Credential {
    fn from(secret: String) -> Self {
        Credential::new(secret)
    }
}

impl From<&str> for Credential {
    fn from(secret: &str) -> Self {
        Credential::new(secret.to_string())
    }
}
