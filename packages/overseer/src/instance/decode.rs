use process_host::OutputStream;

/// Incremental UTF-8 decoding of process output.
///
/// Reads can split a multi-byte character across chunks; the incomplete tail
/// is held back until the next chunk instead of being replaced.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::with_capacity(self.pending.len());
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is left once the stream has ended
    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// One decoder per pipe, so interleaved stdout and stderr chunks never
/// complete each other's characters
#[derive(Debug, Default)]
pub(crate) struct OutputDecoders {
    stdout: Utf8Decoder,
    stderr: Utf8Decoder,
}

impl OutputDecoders {
    pub(crate) fn decode(&mut self, stream: OutputStream, bytes: &[u8]) -> String {
        match stream {
            OutputStream::Stdout => self.stdout.decode(bytes),
            OutputStream::Stderr => self.stderr.decode(bytes),
        }
    }

    pub(crate) fn finish(&mut self) -> String {
        let mut rest = self.stdout.finish();
        rest.push_str(&self.stderr.finish());
        rest
    }
}
