//! XMLTV guide filter.
//!
//! Produces a document with the same root element as the upstream guide,
//! exactly one `<channel>` (copied from upstream when present, synthesized
//! otherwise) and every `<programme>` that references the canonical channel.
//! Kept elements are re-emitted event for event, so their content is
//! byte-for-byte what upstream sent.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use super::{ContentFilter, FilterError};

const CHANNEL: &[u8] = b"channel";
const PROGRAMME: &[u8] = b"programme";

#[derive(Debug, Clone)]
pub struct GuideFilter {
    channel_id: String,
    channel_name: String,
}

impl GuideFilter {
    pub fn new(channel_id: impl Into<String>, channel_name: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_name: channel_name.into(),
        }
    }

    pub fn filter(&self, raw: &[u8]) -> Result<Vec<u8>, FilterError> {
        let doc = self.select(raw)?;
        self.render(&doc)
    }

    /// Walk the top level of the document once, keeping the first matching
    /// channel and every matching programme.
    fn select<'a>(&self, raw: &'a [u8]) -> Result<Selection<'a>, FilterError> {
        let mut reader = Reader::from_reader(raw);
        let mut channel: Option<Element<'a>> = None;
        let mut programmes: Vec<Element<'a>> = Vec::new();

        // Prolog: everything up to the root element.
        let root = loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    check_attributes(&start)?;
                    break start;
                }
                Event::Empty(start) => {
                    check_attributes(&start)?;
                    expect_epilog(&mut reader)?;
                    return Ok(Selection {
                        root: start,
                        channel: None,
                        programmes,
                    });
                }
                Event::Text(text) => expect_blank(&text, "text before the root element")?,
                Event::End(_) => {
                    return Err(FilterError::Unexpected("end tag before the root element"))
                }
                Event::Eof => return Err(FilterError::MissingRoot),
                _ => {}
            }
        };

        // Direct children of the root.
        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    let element = read_subtree(&mut reader, start)?;
                    self.keep(element, &mut channel, &mut programmes)?;
                }
                Event::Empty(start) => {
                    check_attributes(&start)?;
                    let element = Element {
                        events: vec![Event::Empty(start)],
                    };
                    self.keep(element, &mut channel, &mut programmes)?;
                }
                Event::Text(text) => {
                    text.unescape()?;
                }
                Event::End(_) => break,
                Event::Eof => return Err(FilterError::Truncated(tag_name(&root))),
                _ => {}
            }
        }
        expect_epilog(&mut reader)?;

        Ok(Selection {
            root,
            channel,
            programmes,
        })
    }

    fn keep<'a>(
        &self,
        element: Element<'a>,
        channel: &mut Option<Element<'a>>,
        programmes: &mut Vec<Element<'a>>,
    ) -> Result<(), FilterError> {
        let start = element.start();
        let is_channel = channel.is_none()
            && start.name().as_ref() == CHANNEL
            && attr_equals(start, b"id", &self.channel_id)?;
        let is_programme = start.name().as_ref() == PROGRAMME
            && attr_equals(start, b"channel", &self.channel_id)?;

        if is_channel {
            *channel = Some(element);
        } else if is_programme {
            programmes.push(element);
        }
        Ok(())
    }

    fn render(&self, doc: &Selection<'_>) -> Result<Vec<u8>, FilterError> {
        let mut writer = Writer::new(Vec::new());

        emit(
            &mut writer,
            Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
        )?;
        writer.get_mut().push(b'\n');
        emit(&mut writer, Event::Start(doc.root.borrow()))?;
        writer.get_mut().push(b'\n');

        match &doc.channel {
            Some(channel) => {
                for event in &channel.events {
                    emit(&mut writer, event.borrow())?;
                }
            }
            None => {
                let mut start = BytesStart::new("channel");
                start.push_attribute(("id", self.channel_id.as_str()));
                emit(&mut writer, Event::Start(start))?;
                emit(&mut writer, Event::Start(BytesStart::new("display-name")))?;
                emit(&mut writer, Event::Text(BytesText::new(&self.channel_name)))?;
                emit(&mut writer, Event::End(BytesEnd::new("display-name")))?;
                emit(&mut writer, Event::End(BytesEnd::new("channel")))?;
            }
        }
        writer.get_mut().push(b'\n');

        for programme in &doc.programmes {
            for event in &programme.events {
                emit(&mut writer, event.borrow())?;
            }
            writer.get_mut().push(b'\n');
        }

        emit(&mut writer, Event::End(doc.root.to_end()))?;
        writer.get_mut().push(b'\n');
        Ok(writer.into_inner())
    }
}

impl ContentFilter for GuideFilter {
    fn apply(&self, raw: &[u8]) -> Result<Vec<u8>, FilterError> {
        self.filter(raw)
    }
}

// ---------------------------------------------------------------------------
// Parsed pieces
// ---------------------------------------------------------------------------

struct Selection<'a> {
    root: BytesStart<'a>,
    channel: Option<Element<'a>>,
    programmes: Vec<Element<'a>>,
}

/// A complete top-level element as the raw events that make it up.
struct Element<'a> {
    events: Vec<Event<'a>>,
}

impl<'a> Element<'a> {
    fn start(&self) -> &BytesStart<'a> {
        match self.events.first() {
            Some(Event::Start(start)) | Some(Event::Empty(start)) => start,
            _ => unreachable!("an element always begins with its start tag"),
        }
    }
}

/// Collect `start` and everything up to its matching end tag, rejecting
/// malformed attributes and undecodable text on the way.
fn read_subtree<'a>(
    reader: &mut Reader<&'a [u8]>,
    start: BytesStart<'a>,
) -> Result<Element<'a>, FilterError> {
    check_attributes(&start)?;
    let name = tag_name(&start);
    let mut events = vec![Event::Start(start)];
    let mut depth = 1usize;

    while depth > 0 {
        let event = reader.read_event()?;
        match &event {
            Event::Start(start) => {
                check_attributes(start)?;
                depth += 1;
            }
            Event::Empty(start) => check_attributes(start)?,
            Event::Text(text) => {
                text.unescape()?;
            }
            Event::End(_) => depth -= 1,
            Event::Eof => return Err(FilterError::Truncated(name)),
            _ => {}
        }
        events.push(event);
    }
    Ok(Element { events })
}

/// Only whitespace, comments and processing instructions may follow the
/// root element.
fn expect_epilog(reader: &mut Reader<&[u8]>) -> Result<(), FilterError> {
    loop {
        match reader.read_event()? {
            Event::Eof => return Ok(()),
            Event::Text(text) => expect_blank(&text, "text after the root element")?,
            Event::Start(_) | Event::Empty(_) | Event::End(_) => {
                return Err(FilterError::Unexpected("markup after the root element"))
            }
            _ => {}
        }
    }
}

fn expect_blank(text: &BytesText<'_>, context: &'static str) -> Result<(), FilterError> {
    if text.iter().all(u8::is_ascii_whitespace) {
        Ok(())
    } else {
        Err(FilterError::Unexpected(context))
    }
}

fn check_attributes(start: &BytesStart<'_>) -> Result<(), FilterError> {
    for attr in start.attributes().with_checks(true) {
        attr?.unescape_value()?;
    }
    Ok(())
}

fn emit(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), FilterError> {
    writer
        .write_event(event)
        .map_err(|e| FilterError::Render(e.to_string()))
}

fn attr_equals(start: &BytesStart<'_>, key: &[u8], expected: &str) -> Result<bool, FilterError> {
    match start.try_get_attribute(key)? {
        Some(attr) => Ok(attr.unescape_value()? == expected),
        None => Ok(false),
    }
}

fn tag_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUIDE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE tv SYSTEM "xmltv.dtd">
<tv generator-info-name="upstream" source-info-url="https://example.test">
  <channel id="y"><display-name>Why TV</display-name></channel>
  <channel id="x"><display-name lang="ar">Ex &amp; Co</display-name><icon src="x.png"/></channel>
  <channel id="x"><display-name>Duplicate</display-name></channel>
  <programme start="20250101000000 +0200" stop="20250101010000 +0200" channel="x">
    <title>Morning News</title>
  </programme>
  <programme start="20250101000000 +0200" stop="20250101010000 +0200" channel="y">
    <title>Elsewhere</title>
  </programme>
  <programme start="20250101010000 +0200" stop="20250101020000 +0200" channel="x">
    <title>Talk &lt;Live&gt;</title>
  </programme>
</tv>
"#;

    fn run(filter: &GuideFilter, raw: &str) -> String {
        String::from_utf8(filter.filter(raw.as_bytes()).unwrap()).unwrap()
    }

    #[test]
    fn keeps_matching_channel_and_programmes() {
        let out = run(&GuideFilter::new("x", "Ex"), GUIDE);

        assert!(out.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?>"#));
        assert!(out.contains(
            r#"<tv generator-info-name="upstream" source-info-url="https://example.test">"#
        ));
        assert_eq!(out.matches("<channel ").count(), 1);
        assert!(out.contains(
            r#"<channel id="x"><display-name lang="ar">Ex &amp; Co</display-name><icon src="x.png"/></channel>"#
        ));
        assert!(!out.contains("Duplicate"));
        assert_eq!(out.matches("<programme ").count(), 2);
        assert!(out.contains("Morning News"));
        assert!(out.contains("Talk &lt;Live&gt;"));
        assert!(!out.contains("Elsewhere"));
        assert!(out.trim_end().ends_with("</tv>"));
    }

    #[test]
    fn programmes_keep_document_order() {
        let out = run(&GuideFilter::new("x", "Ex"), GUIDE);
        let first = out.find("Morning News").unwrap();
        let second = out.find("Talk &lt;Live&gt;").unwrap();
        assert!(first < second);
    }

    #[test]
    fn synthesizes_missing_channel() {
        let out = run(&GuideFilter::new("z", "Zed & Sons"), GUIDE);
        assert!(out.contains(
            r#"<channel id="z"><display-name>Zed &amp; Sons</display-name></channel>"#
        ));
        assert_eq!(out.matches("<channel ").count(), 1);
        assert_eq!(out.matches("<programme ").count(), 0);
    }

    #[test]
    fn orphan_programmes_are_kept_with_synthesized_channel() {
        let raw = r#"<tv><programme channel="z" start="1"><title>Solo</title></programme></tv>"#;
        let out = run(&GuideFilter::new("z", "Zed"), raw);
        assert!(out.contains(r#"<channel id="z"><display-name>Zed</display-name></channel>"#));
        assert!(out.contains(r#"<programme channel="z" start="1"><title>Solo</title></programme>"#));
    }

    #[test]
    fn self_closing_elements_are_handled() {
        let raw = r#"<tv><channel id="x"/><programme channel="x" start="1"/></tv>"#;
        let out = run(&GuideFilter::new("x", "Ex"), raw);
        assert!(out.contains(r#"<channel id="x"/>"#));
        assert!(out.contains(r#"<programme channel="x" start="1"/>"#));
    }

    #[test]
    fn nested_channel_tags_are_not_top_level() {
        let raw = r#"<tv><group><channel id="x"><display-name>Nested</display-name></channel></group></tv>"#;
        let out = run(&GuideFilter::new("x", "Ex"), raw);
        assert!(!out.contains("Nested"));
        assert!(out.contains(r#"<display-name>Ex</display-name>"#));
    }

    #[test]
    fn empty_root_yields_synthesized_channel() {
        let out = run(&GuideFilter::new("x", "Ex"), "<tv/>");
        assert!(out.contains("<tv>"));
        assert!(out.contains(r#"<channel id="x">"#));
        assert!(out.trim_end().ends_with("</tv>"));
    }

    #[test]
    fn truncated_document_is_rejected() {
        let raw = r#"<tv><channel id="x"><display-name>Ex</display-name>"#;
        assert!(GuideFilter::new("x", "Ex").filter(raw.as_bytes()).is_err());

        let raw = r#"<tv><channel id="x"></channel>"#;
        assert!(GuideFilter::new("x", "Ex").filter(raw.as_bytes()).is_err());
    }

    #[test]
    fn mismatched_tags_are_rejected() {
        let raw = r#"<tv><channel id="x"></programme></tv>"#;
        assert!(GuideFilter::new("x", "Ex").filter(raw.as_bytes()).is_err());
    }

    #[test]
    fn unquoted_attribute_in_kept_element_is_rejected() {
        let raw = r#"<tv><channel id="x"/><programme channel="x"><title lang=en>A</title></programme></tv>"#;
        assert!(GuideFilter::new("x", "Ex").filter(raw.as_bytes()).is_err());
    }

    #[test]
    fn bare_ampersand_is_rejected() {
        let filter = GuideFilter::new("x", "Ex");
        let in_text = r#"<tv><programme channel="x"><title>A & B</title></programme></tv>"#;
        assert!(filter.filter(in_text.as_bytes()).is_err());

        let in_attribute = r#"<tv><channel id="x"><icon src="a?b=1&c=2"/></channel></tv>"#;
        assert!(filter.filter(in_attribute.as_bytes()).is_err());
    }

    #[test]
    fn text_around_the_root_is_rejected() {
        let filter = GuideFilter::new("x", "Ex");
        let before = r#"junk before<tv><channel id="x"/></tv>"#;
        assert!(matches!(
            filter.filter(before.as_bytes()),
            Err(FilterError::Unexpected(_))
        ));

        let after = r#"<tv><channel id="x"/></tv>garbage"#;
        assert!(matches!(
            filter.filter(after.as_bytes()),
            Err(FilterError::Unexpected(_))
        ));
    }

    #[test]
    fn second_root_element_is_rejected() {
        let filter = GuideFilter::new("x", "Ex");
        let raw = r#"<tv><channel id="x"/></tv><tv>trailing</tv>"#;
        assert!(filter.filter(raw.as_bytes()).is_err());
        assert!(filter.filter(b"<tv/><tv/>").is_err());
    }

    #[test]
    fn comments_and_whitespace_around_the_root_are_accepted() {
        let raw = "<?xml version=\"1.0\"?>\n<!-- feed -->\n<tv><channel id=\"x\"/></tv>\n<!-- end -->\n";
        let out = run(&GuideFilter::new("x", "Ex"), raw);
        assert!(out.contains(r#"<channel id="x"/>"#));
    }

    #[test]
    fn document_without_root_is_rejected() {
        let err = GuideFilter::new("x", "Ex").filter(b"   ").unwrap_err();
        assert!(matches!(err, FilterError::MissingRoot));
    }

    #[test]
    fn filtering_is_idempotent() {
        let filter = GuideFilter::new("x", "Ex");
        let once = filter.apply(GUIDE.as_bytes()).unwrap();
        let twice = filter.apply(GUIDE.as_bytes()).unwrap();
        assert_eq!(once, twice);
        // The output is itself a valid guide that filters to itself.
        assert_eq!(filter.apply(&once).unwrap(), once);
    }
}
