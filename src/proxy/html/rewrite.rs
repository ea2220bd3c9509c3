//! HTML link rewriting and re-serialization
//!
//! Consumes the tokenizer's output, rewrites `href`/`src` attributes that
//! point at the proxied upstream, and serializes the tokens back to markup.
//! The per-document state is exactly two sticky flags: the first
//! `<base href>` becomes the resolution base for the rest of the document,
//! and an XML declaration or an `xmlns` attribute on the root element
//! switches serialization to XML mode for good (void elements self-close).

use bytes::Bytes;
use futures_util::Stream;
use http::header::CONTENT_TYPE;
use http::HeaderMap;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use url::Url;

use crate::proxy::html::tokenizer::{Token, Tokenizer};

/// Elements that never get a separate closing tag
const VOID_ELEMENTS: [&str; 23] = [
    "area", "base", "basefont", "bgsound", "br", "col", "command", "embed", "frame", "hr",
    "image", "img", "input", "isindex", "keygen", "link", "menuitem", "meta", "nextid", "param",
    "source", "track", "wbr",
];

/// Elements whose `href` attribute is a URL
const HREF_ELEMENTS: [&str; 4] = ["a", "area", "base", "link"];

/// Elements whose `src` attribute is a URL
const SRC_ELEMENTS: [&str; 9] = [
    "audio", "embed", "iframe", "img", "input", "script", "source", "track", "video",
];

/// Content types that get the HTML rewrite treatment
const HTML_CONTENT_TYPES: [&str; 3] = [
    "text/html",
    "application/xhtml+xml",
    "application/vnd.wap.xhtml+xml",
];

/// Whether the response body should be rewritten, judged by content type.
pub fn should_rewrite(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| HTML_CONTENT_TYPES.iter().any(|html| ct.starts_with(html)))
}

fn is_void(name: &str) -> bool {
    VOID_ELEMENTS.contains(&name)
}

/// Token-to-markup serializer with URL rewriting
pub struct HtmlRewriter {
    /// Upstream URL of the document being rewritten, query stripped
    doc_url: Url,
    /// Upstream base URL; this prefix gets swapped for `base_url`
    href: String,
    /// The proxy's public mount path
    base_url: String,
    /// Sticky: set once by the first `<base href>`
    base_href: Option<Url>,
    /// Sticky: set by an XML declaration or `xmlns` on the root element
    is_xml: bool,
}

impl HtmlRewriter {
    pub fn new(doc_url: Url, href: String, base_url: String) -> Self {
        Self {
            doc_url,
            href,
            base_url,
            base_href: None,
            is_xml: false,
        }
    }

    /// Serialize a batch of tokens to markup.
    pub fn render(&mut self, tokens: Vec<Token>) -> Bytes {
        let mut out = Vec::new();
        for token in tokens {
            self.write_token(token, &mut out);
        }
        Bytes::from(out)
    }

    fn write_token(&mut self, token: Token, out: &mut Vec<u8>) {
        match token {
            Token::Open { name, attrs } => {
                if !self.is_xml && name == "html" && attrs.iter().any(|(n, _)| n == "xmlns") {
                    self.is_xml = true;
                }
                out.push(b'<');
                out.extend_from_slice(name.as_bytes());
                for (attr, value) in attrs {
                    let value = if (attr == "src" && SRC_ELEMENTS.contains(&name.as_str()))
                        || (attr == "href" && HREF_ELEMENTS.contains(&name.as_str()))
                    {
                        if self.base_href.is_none() && name == "base" {
                            self.base_href = self.doc_url.join(&value).ok();
                        }
                        self.rewrite_url(&value)
                    } else {
                        value
                    };
                    out.push(b' ');
                    out.extend_from_slice(attr.as_bytes());
                    out.extend_from_slice(b"=\"");
                    out.extend_from_slice(value.replace('"', "&quot;").as_bytes());
                    out.push(b'"');
                }
                if self.is_xml && is_void(&name) {
                    out.extend_from_slice(b" />");
                } else {
                    out.push(b'>');
                }
            }
            Token::Close(name) => {
                if !is_void(&name) {
                    out.extend_from_slice(b"</");
                    out.extend_from_slice(name.as_bytes());
                    out.push(b'>');
                }
            }
            Token::Text(text) => out.extend_from_slice(&text),
            Token::Comment(text) => {
                out.extend_from_slice(b"<!--");
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"-->");
            }
            Token::Pi { name, data } => {
                if !self.is_xml && name.contains("?xml") {
                    self.is_xml = true;
                }
                out.push(b'<');
                out.extend_from_slice(data.as_bytes());
                out.push(b'>');
            }
        }
    }

    /// Rewrite one candidate URL: fragments pass through; everything else is
    /// resolved against the sticky base (or the document URL) and the
    /// upstream prefix is swapped for the proxy's base path. A value outside
    /// the upstream prefix passes through resolved but unsubstituted.
    fn rewrite_url(&self, value: &str) -> String {
        if value.starts_with('#') {
            return value.to_string();
        }
        let base = self.base_href.as_ref().unwrap_or(&self.doc_url);
        match base.join(value) {
            Ok(resolved) => match resolved.as_str().strip_prefix(&self.href) {
                Some(rest) => format!("{}{}", self.base_url, rest),
                None => resolved.as_str().to_string(),
            },
            Err(_) => value.to_string(),
        }
    }
}

pin_project! {
    /// Streaming body adapter: bytes in, rewritten markup out.
    ///
    /// Tokens already serialized before an error stay written; the error
    /// itself terminates the stream.
    pub struct HtmlRewriteStream<S> {
        #[pin]
        inner: S,
        tokenizer: Tokenizer,
        rewriter: HtmlRewriter,
        done: bool,
    }
}

impl<S> HtmlRewriteStream<S> {
    pub fn new(inner: S, rewriter: HtmlRewriter) -> Self {
        Self {
            inner,
            tokenizer: Tokenizer::new(),
            rewriter,
            done: false,
        }
    }
}

impl<S> Stream for HtmlRewriteStream<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if *this.done {
                return Poll::Ready(None);
            }
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let mut tokens = Vec::new();
                    if let Err(e) = this.tokenizer.push(&chunk, &mut tokens) {
                        *this.done = true;
                        return Poll::Ready(Some(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            e,
                        ))));
                    }
                    let out = this.rewriter.render(tokens);
                    if out.is_empty() {
                        // a token is still spanning chunks; keep reading
                        continue;
                    }
                    return Poll::Ready(Some(Ok(out)));
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    *this.done = true;
                    let mut tokens = Vec::new();
                    this.tokenizer.finish(&mut tokens);
                    let out = this.rewriter.render(tokens);
                    return if out.is_empty() {
                        Poll::Ready(None)
                    } else {
                        Poll::Ready(Some(Ok(out)))
                    };
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt, TryStreamExt};

    fn rewriter() -> HtmlRewriter {
        HtmlRewriter::new(
            Url::parse("http://proxy.my/home/").unwrap(),
            "http://proxy.my".to_string(),
            "/proxy".to_string(),
        )
    }

    fn rewrite(input: &str) -> String {
        rewrite_chunks(&[input])
    }

    fn rewrite_chunks(chunks: &[&str]) -> String {
        let mut tokenizer = Tokenizer::new();
        let mut rewriter = rewriter();
        let mut out = Vec::new();
        let mut tokens = Vec::new();
        for chunk in chunks {
            tokenizer.push(chunk.as_bytes(), &mut tokens).unwrap();
        }
        tokenizer.finish(&mut tokens);
        out.extend_from_slice(&rewriter.render(tokens));
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn rewrites_relative_href_against_document_url() {
        assert_eq!(rewrite(r#"<a href="y">l</a>"#), r#"<a href="/proxy/home/y">l</a>"#);
    }

    #[test]
    fn rewrites_absolute_and_rooted_urls() {
        assert_eq!(
            rewrite(r#"<img src="/logo.png"><a href="http://proxy.my/a/b">x</a>"#),
            r#"<img src="/proxy/logo.png"><a href="/proxy/a/b">x</a>"#
        );
    }

    #[test]
    fn keeps_fragment_references() {
        assert_eq!(rewrite(r##"<a href="#top">t</a>"##), r##"<a href="#top">t</a>"##);
    }

    #[test]
    fn keeps_other_origins_resolved_but_unsubstituted() {
        assert_eq!(
            rewrite(r#"<a href="https://other.my/x">x</a>"#),
            r#"<a href="https://other.my/x">x</a>"#
        );
    }

    #[test]
    fn base_href_is_sticky_and_governs_resolution() {
        assert_eq!(
            rewrite(r#"<base href="/x/"><a href="y">l</a>"#),
            r#"<base href="/proxy/x/"><a href="/proxy/x/y">l</a>"#
        );
    }

    #[test]
    fn first_base_wins() {
        assert_eq!(
            rewrite(r#"<base href="/x/"><base href="/z/"><a href="y">l</a>"#),
            r#"<base href="/proxy/x/"><base href="/proxy/z/"><a href="/proxy/x/y">l</a>"#
        );
    }

    #[test]
    fn void_elements_in_html_mode() {
        assert_eq!(rewrite("<p>a<br>b</p>"), "<p>a<br>b</p>");
        // a stray closing tag for a void element is suppressed
        assert_eq!(rewrite("<p>a<br></br>b</p>"), "<p>a<br>b</p>");
    }

    #[test]
    fn void_elements_self_close_in_xml_mode() {
        assert_eq!(
            rewrite(r#"<html xmlns="http://www.w3.org/1999/xhtml"><br></html>"#),
            r#"<html xmlns="http://www.w3.org/1999/xhtml"><br /></html>"#
        );
    }

    #[test]
    fn xml_declaration_switches_mode() {
        assert_eq!(
            rewrite(r#"<?xml version="1.0"?><html><br></html>"#),
            r#"<?xml version="1.0"?><html><br /></html>"#
        );
    }

    #[test]
    fn non_url_attributes_pass_through() {
        assert_eq!(
            rewrite(r#"<div href="/keep" class="x">y</div>"#),
            r#"<div href="/keep" class="x">y</div>"#
        );
    }

    #[test]
    fn script_src_is_rewritten_and_contents_kept_raw() {
        assert_eq!(
            rewrite(r#"<script src="/app.js"></script><script>if (1 < 2) go("/raw");</script>"#),
            r#"<script src="/proxy/app.js"></script><script>if (1 < 2) go("/raw");</script>"#
        );
    }

    #[test]
    fn text_and_comments_are_verbatim() {
        assert_eq!(
            rewrite("<p>a &amp; b</p><!-- keep <a href=\"/x\"> -->"),
            "<p>a &amp; b</p><!-- keep <a href=\"/x\"> -->"
        );
    }

    #[test]
    fn decoded_quotes_are_requoted_safely() {
        assert_eq!(
            rewrite(r#"<div title="say &quot;hi&quot;">x</div>"#),
            r#"<div title="say &quot;hi&quot;">x</div>"#
        );
    }

    #[test]
    fn rewrite_is_stable_across_chunk_boundaries() {
        let whole = rewrite(r#"<p><a href="a/b">link</a></p>"#);
        let split = rewrite_chunks(&["<p><a hre", r#"f="a/b">li"#, "nk</a></p>"]);
        assert_eq!(whole, split);
    }

    #[tokio::test]
    async fn stream_adapter_rewrites_and_flushes() {
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"<a href=\"y\">l")),
            Ok(Bytes::from_static(b"ink</a")),
            Ok(Bytes::from_static(b">")),
        ];
        let stream = HtmlRewriteStream::new(stream::iter(chunks), rewriter());
        let out: Vec<Bytes> = stream.try_collect().await.unwrap();
        let joined: Vec<u8> = out.iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(joined, br#"<a href="/proxy/home/y">link</a>"#);
    }

    #[tokio::test]
    async fn stream_adapter_propagates_inner_errors() {
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"<p>ok</p>")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "boom")),
        ];
        let mut stream = HtmlRewriteStream::new(stream::iter(chunks), rewriter());
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Bytes::from_static(b"<p>ok</p>")
        );
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }
}
