use crate::DocId;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use thiserror::Error;
use url::Url;

/// Bytes that must be escaped when a document id travels inside a URL
/// path. Everything else (including `/`, which we rely on for path
/// structure) passes through untouched; non-ASCII is always escaped.
const PATH_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("base document URL {0} must carry a path ending in '/'")]
    BaseUrlWithoutPath(Url),
    #[error("empty document id")]
    EmptyDocId,
    #[error("{uri:?} does not live under the document path {base:?}")]
    OutsideBasePath { uri: String, base: String },
    #[error("malformed request URI {uri:?}: {reason}")]
    MalformedUri { uri: String, reason: String },
    #[error("document id {id:?} is not itself a valid URL: {source}")]
    NotAUrl {
        id: String,
        source: url::ParseError,
    },
}

/// Maps document ids to URLs below a base URL, and back.
///
/// The mapping is injective: two distinct ids never encode to the same
/// URL, and `decode(encode(id)) == id` for every non-empty id. Ids may
/// contain `/./`, `/../`, `//` and other sequences that URL resolvers
/// like to normalize away; the encoder escapes those structurally
/// before percent-encoding so that the appliance hands the URL back
/// byte-for-byte.
///
/// With `is_doc_id_url` the repository's ids are themselves URLs and
/// the structural rules are skipped entirely.
pub struct DocIdCodec {
    base_url: Url,
    is_doc_id_url: bool,
}

impl DocIdCodec {
    pub fn new(base_url: Url, is_doc_id_url: bool) -> Result<Self, CodecError> {
        if base_url.path().is_empty() || !base_url.path().ends_with('/') {
            return Err(CodecError::BaseUrlWithoutPath(base_url));
        }
        Ok(Self {
            base_url,
            is_doc_id_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn is_doc_id_url(&self) -> bool {
        self.is_doc_id_url
    }

    pub fn encode(&self, doc_id: &DocId) -> Result<Url, CodecError> {
        let id = doc_id.unique_id();
        if id.is_empty() {
            return Err(CodecError::EmptyDocId);
        }
        if self.is_doc_id_url {
            return Url::parse(id).map_err(|source| CodecError::NotAUrl {
                id: id.to_string(),
                source,
            });
        }
        let escaped = escape_structure(id);
        let quoted = utf8_percent_encode(&escaped, PATH_SET).to_string();
        // A plain string join: Url::join would resolve dot segments,
        // which is exactly what the structural escaping guards against.
        let absolute = format!("{}{}", self.base_url, quoted);
        Url::parse(&absolute).map_err(|source| CodecError::NotAUrl {
            id: absolute,
            source,
        })
    }

    /// Decode the path of a request URI back into the id it encodes.
    /// `request_uri` is either an absolute URI or a bare path as it
    /// arrived on the wire (still percent-encoded, query excluded).
    pub fn decode(&self, request_uri: &str) -> Result<DocId, CodecError> {
        if self.is_doc_id_url {
            return Ok(DocId::new(request_uri));
        }
        let path = if request_uri.starts_with('/') {
            request_uri.to_string()
        } else {
            let url = Url::parse(request_uri).map_err(|err| CodecError::MalformedUri {
                uri: request_uri.to_string(),
                reason: err.to_string(),
            })?;
            url.path().to_string()
        };
        let base_path = self.base_url.path();
        let remainder = path
            .strip_prefix(base_path)
            .ok_or_else(|| CodecError::OutsideBasePath {
                uri: request_uri.to_string(),
                base: base_path.to_string(),
            })?;
        let decoded = percent_decode_str(remainder)
            .decode_utf8()
            .map_err(|err| CodecError::MalformedUri {
                uri: request_uri.to_string(),
                reason: err.to_string(),
            })?;
        let id = unescape_structure(&decoded);
        if id.is_empty() {
            return Err(CodecError::EmptyDocId);
        }
        Ok(DocId::new(id))
    }
}

/// Whole-segment match for `_*index.html` / `_*index.htm`.
fn is_index_file(segment: &str) -> bool {
    let stripped = segment.trim_start_matches('_');
    stripped == "index.html" || stripped == "index.htm"
}

/// Apply the structural escaping rules, in order:
///
/// 1. every run of dots that forms a whole path segment grows three
///    extra dots, so `/../` and `/./` survive URL normalizers;
/// 2. an empty segment between two slashes becomes `...`, except right
///    after a segment ending in `:` (preserving `scheme://`);
/// 3. a final segment of `_*index.htm(l)` gains a leading underscore,
///    dodging the appliance's index-file collapsing;
/// 4. an id starting with `/` is prefixed with `...` so joining to the
///    base path cannot produce `//`.
fn escape_structure(id: &str) -> String {
    let segments: Vec<&str> = id.split('/').collect();
    let last = segments.len() - 1;
    let mut out: Vec<String> = Vec::with_capacity(segments.len());
    for (i, segment) in segments.iter().enumerate() {
        if !segment.is_empty() && segment.bytes().all(|b| b == b'.') {
            out.push(format!("{segment}..."));
        } else if segment.is_empty() && i > 0 && i < last && !segments[i - 1].ends_with(':') {
            out.push("...".to_string());
        } else if i == last && is_index_file(segment) {
            out.push(format!("_{segment}"));
        } else {
            out.push((*segment).to_string());
        }
    }
    let mut joined = out.join("/");
    if id.starts_with('/') {
        joined.insert_str(0, "...");
    }
    joined
}

/// Exact inverse of [`escape_structure`].
///
/// Every all-dot segment in escaped text has at least four dots, so a
/// segment of exactly `...` can only be the `//` escape (rule 2) or
/// the leading-slash prefix (rule 4); the prefix is recognizable as a
/// leading `.../`.
fn unescape_structure(escaped: &str) -> String {
    let escaped = match escaped.strip_prefix("...") {
        Some(rest) if rest.starts_with('/') => rest,
        _ => escaped,
    };
    let segments: Vec<&str> = escaped.split('/').collect();
    let last = segments.len() - 1;
    let mut out: Vec<String> = Vec::with_capacity(segments.len());
    for (i, segment) in segments.iter().enumerate() {
        if *segment == "..." && i > 0 && i < last && !segments[i - 1].ends_with(':') {
            out.push(String::new());
        } else if segment.len() >= 4 && segment.bytes().all(|b| b == b'.') {
            out.push(segment[..segment.len() - 3].to_string());
        } else if i == last && segment.starts_with('_') && is_index_file(&segment[1..]) {
            out.push(segment[1..].to_string());
        } else {
            out.push((*segment).to_string());
        }
    }
    out.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> DocIdCodec {
        DocIdCodec::new(Url::parse("http://localhost:5678/doc/").unwrap(), false).unwrap()
    }

    fn round_trip(id: &str) {
        let codec = codec();
        let doc_id = DocId::new(id);
        let url = codec.encode(&doc_id).unwrap();
        assert_eq!(
            codec.decode(url.path()).unwrap(),
            doc_id,
            "{id:?} did not survive the codec (encoded as {url})"
        );
    }

    #[test]
    fn plain_ids_pass_through() {
        let codec = codec();
        let url = codec.encode(&DocId::new("some/docid")).unwrap();
        k9::assert_equal!(url.as_str(), "http://localhost:5678/doc/some/docid");
    }

    #[test]
    fn dot_runs_are_extended() {
        let codec = codec();
        let url = codec.encode(&DocId::new("..")).unwrap();
        k9::assert_equal!(url.as_str(), "http://localhost:5678/doc/.....");
        assert!(url.as_str().contains("...."));
        k9::assert_equal!(codec.decode(url.path()).unwrap().unique_id(), "..");
    }

    #[test]
    fn mixed_dot_segments_are_untouched() {
        let codec = codec();
        let id = "..safe../.h/h./..h/h..";
        let url = codec.encode(&DocId::new(id)).unwrap();
        assert!(url.as_str().contains(id));
        round_trip(id);
    }

    #[test]
    fn double_slash_is_escaped_but_scheme_is_not() {
        let codec = codec();
        let url = codec.encode(&DocId::new("a//b")).unwrap();
        assert_eq!(url.path(), "/doc/a/.../b");
        let url = codec.encode(&DocId::new("http://example.com/x")).unwrap();
        assert_eq!(url.path(), "/doc/http://example.com/x");
    }

    #[test]
    fn leading_slash_gets_dots_prefix() {
        let codec = codec();
        let url = codec.encode(&DocId::new("/start")).unwrap();
        assert_eq!(url.path(), "/doc/.../start");
    }

    #[test]
    fn index_html_is_shielded() {
        let codec = codec();
        for (id, expected) in [
            ("index.html", "/doc/_index.html"),
            ("index.htm", "/doc/_index.htm"),
            ("_index.html", "/doc/__index.html"),
            ("a/__index.htm", "/doc/a/___index.htm"),
            ("notindex.html", "/doc/notindex.html"),
            ("index.html/x", "/doc/index.html/x"),
        ] {
            assert_eq!(codec.encode(&DocId::new(id)).unwrap().path(), expected);
        }
    }

    #[test]
    fn percent_and_space_are_quoted() {
        let codec = codec();
        let url = codec.encode(&DocId::new("a b%c?d#e")).unwrap();
        assert_eq!(url.path(), "/doc/a%20b%25c%3Fd%23e");
        round_trip("a b%c?d#e");
    }

    #[test]
    fn round_trips() {
        for id in [
            "simple",
            "with space",
            "with/slash",
            "trailing/",
            "/leading",
            "//",
            "///",
            "a//b",
            "a///b",
            "a//",
            "//a",
            ".",
            "..",
            "...",
            "..../",
            "./../.",
            "a/../b",
            "a/./b",
            ".../x",
            "...x",
            "x/...",
            "http://example.com//x",
            "https://host/./../x",
            "index.html",
            "index.htm",
            "_index.html",
            "____index.htm",
            "dir/index.html",
            "100% certain?",
            "snowman \u{2603} likes unicode",
            "tab\there",
            "..safe../.h/h./..h/h..",
        ] {
            round_trip(id);
        }
    }

    // A deterministic xorshift so the property runs the same inputs
    // every time.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn pick<'a>(&mut self, items: &[&'a str]) -> &'a str {
            items[(self.next() % items.len() as u64) as usize]
        }
    }

    #[test]
    fn generated_ids_round_trip() {
        // Fragments weighted toward everything that historically broke
        // naive codecs: dot runs, slash runs, colons, index files,
        // percent signs, spaces, non-ASCII.
        let fragments = [
            ".", "..", "...", "/", "//", ":", "://", "a", "b0", "_", "%", "%2F", " ", "\u{e9}",
            "index.html", "index.htm", "_index.html", "!", "doc",
        ];
        let mut rng = Rng(0x1234_5678_9abc_def0);
        for _ in 0..500 {
            let pieces = 1 + (rng.next() % 8) as usize;
            let id: String = (0..pieces).map(|_| rng.pick(&fragments)).collect();
            round_trip(&id);
        }
    }

    #[test]
    fn distinct_ids_encode_distinctly() {
        // A few pairs that would collide without structural escaping.
        let codec = codec();
        for (a, b) in [
            ("a//b", "a/.../b"),
            ("/x", ".../x"),
            ("..", "....."),
            ("index.html", "_index.html"),
        ] {
            let ua = codec.encode(&DocId::new(a)).unwrap();
            let ub = codec.encode(&DocId::new(b)).unwrap();
            assert_ne!(ua, ub, "{a:?} and {b:?} collided at {ua}");
            round_trip(a);
            round_trip(b);
        }
    }

    #[test]
    fn doc_id_url_mode_skips_the_rules() {
        let codec =
            DocIdCodec::new(Url::parse("http://localhost:5678/doc/").unwrap(), true).unwrap();
        let url = codec
            .encode(&DocId::new("http://repo.example.com/a/b?x=1"))
            .unwrap();
        assert_eq!(url.as_str(), "http://repo.example.com/a/b?x=1");
        assert_eq!(
            codec.decode("http://repo.example.com/a/b?x=1").unwrap(),
            DocId::new("http://repo.example.com/a/b?x=1")
        );
    }

    #[test]
    fn base_url_must_have_a_directory_path() {
        for base in ["http://localhost:5678/doc", "http://localhost:5678"] {
            let url = Url::parse(base).unwrap();
            if url.path().ends_with('/') {
                // Url normalizes a missing path to "/"; only reject
                // paths that do not end in a slash.
                continue;
            }
            assert!(matches!(
                DocIdCodec::new(url, false),
                Err(CodecError::BaseUrlWithoutPath(_))
            ));
        }
    }

    #[test]
    fn decode_requires_the_base_path() {
        let codec = codec();
        assert!(matches!(
            codec.decode("/other/thing"),
            Err(CodecError::OutsideBasePath { .. })
        ));
        assert!(matches!(codec.decode("/doc/"), Err(CodecError::EmptyDocId)));
    }

    #[test]
    fn empty_id_is_rejected() {
        assert!(matches!(
            codec().encode(&DocId::new("")),
            Err(CodecError::EmptyDocId)
        ));
    }
}
