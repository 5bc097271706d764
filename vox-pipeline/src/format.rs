//! MIME/extension sniffing, mirroring the validation step the HTTP source
//! node runs before it starts decoding: check a handful of known content
//! types first, fall back to the URL's extension when the server is vague.

/// Canonical audio container/codec classification. `Opus`/`Ogg`/`WebM`
/// drive a passthrough decision in the pipeline builder; everything else
/// goes through FFmpeg transcoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Opus,
    Ogg,
    WebM,
    Mp3,
    Aac,
    Flac,
    Wav,
    Unknown,
}

const MIME_TABLE: &[(&str, AudioFormat)] = &[
    ("audio/opus", AudioFormat::Opus),
    ("audio/ogg", AudioFormat::Ogg),
    ("application/ogg", AudioFormat::Ogg),
    ("audio/webm", AudioFormat::WebM),
    ("video/webm", AudioFormat::WebM),
    ("audio/mpeg", AudioFormat::Mp3),
    ("audio/mp3", AudioFormat::Mp3),
    ("audio/aac", AudioFormat::Aac),
    ("audio/flac", AudioFormat::Flac),
    ("audio/x-flac", AudioFormat::Flac),
    ("audio/wav", AudioFormat::Wav),
    ("audio/x-wav", AudioFormat::Wav),
    ("audio/wave", AudioFormat::Wav),
];

const EXTENSION_TABLE: &[(&str, AudioFormat)] = &[
    ("opus", AudioFormat::Opus),
    ("ogg", AudioFormat::Ogg),
    ("webm", AudioFormat::WebM),
    ("mp3", AudioFormat::Mp3),
    ("aac", AudioFormat::Aac),
    ("m4a", AudioFormat::Aac),
    ("flac", AudioFormat::Flac),
    ("wav", AudioFormat::Wav),
];

/// Detects the canonical format from an optional MIME type and the request
/// URL. MIME is authoritative when present and recognized (checked exact,
/// then as a prefix before any `;` parameters); otherwise the URL's
/// extension is used.
pub fn detect(mime: Option<&str>, url: &str) -> AudioFormat {
    if let Some(mime) = mime {
        let base = mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase();
        if let Some((_, fmt)) = MIME_TABLE.iter().find(|(m, _)| *m == base) {
            return *fmt;
        }
    }

    let path = url.split(['?', '#']).next().unwrap_or(url);
    if let Some(ext) = path.rsplit('.').next() {
        let ext = ext.to_ascii_lowercase();
        if let Some((_, fmt)) = EXTENSION_TABLE.iter().find(|(e, _)| *e == ext) {
            return *fmt;
        }
    }

    AudioFormat::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_takes_priority_over_extension() {
        assert_eq!(
            detect(Some("audio/ogg; codecs=opus"), "https://cdn.example/track.mp3"),
            AudioFormat::Ogg
        );
    }

    #[test]
    fn falls_back_to_extension_when_mime_missing() {
        assert_eq!(detect(None, "https://cdn.example/track.flac"), AudioFormat::Flac);
    }

    #[test]
    fn falls_back_to_extension_when_mime_unrecognized() {
        assert_eq!(
            detect(Some("application/octet-stream"), "https://cdn.example/track.webm"),
            AudioFormat::WebM
        );
    }

    #[test]
    fn unknown_when_neither_matches() {
        assert_eq!(detect(Some("text/html"), "https://cdn.example/page"), AudioFormat::Unknown);
    }
}
