// A minimal html5ever TreeSink that does nothing but harvest <a> tags (and
// honour <base href>). Structure derived from html5ever's noop-tree-builder
// example, which carries this header:
//
// Copyright 2014-2017 The html5ever Project Developers. See the
// COPYRIGHT file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::prelude::*;

use encoding_rs::Encoding;
use encoding_rs_io::DecodeReaderBytesBuilder;
use std::borrow::{Borrow, Cow};

use html5ever::tendril::*;
use html5ever::tree_builder::{ElementFlags, NodeOrText, QuirksMode, TreeSink};
use html5ever::{expanded_name, local_name, namespace_url, ns, parse_document};
use html5ever::{Attribute, ExpandedName, LocalNameStaticSet, QualName};
use string_cache::Atom;

const BASE_TAG: ExpandedName = expanded_name!(html "base");
const A_TAG: ExpandedName = expanded_name!(html "a");
const HREF_ATTR: Atom<LocalNameStaticSet> = html5ever::local_name!("href");
static REQUIRES_PYTHON_ATTR: Lazy<Atom<LocalNameStaticSet>> =
    Lazy::new(|| Atom::from("data-requires-python"));
static YANKED_ATTR: Lazy<Atom<LocalNameStaticSet>> =
    Lazy::new(|| Atom::from("data-yanked"));
// PEP 658's blessed attribute plus its earlier spelling, both still in the
// wild
static CORE_METADATA_ATTR: Lazy<Atom<LocalNameStaticSet>> =
    Lazy::new(|| Atom::from("data-core-metadata"));
static DIST_INFO_METADATA_ATTR: Lazy<Atom<LocalNameStaticSet>> =
    Lazy::new(|| Atom::from("data-dist-info-metadata"));

/// One <a> out of an index page, attributes and all.
#[derive(Debug, Clone)]
pub struct IndexLink {
    pub url: Url,
    pub requires_python: Option<String>,
    /// Some(reason-or-empty-string) iff data-yanked was present
    pub yanked: Option<String>,
    /// the PEP 658 attribute value, e.g. "true" or "sha256=..."
    pub core_metadata: Option<String>,
}

struct LinkSink {
    next_id: usize,
    names: HashMap<usize, QualName>,
    base: Url,
    changed_base: bool,
    links: Vec<IndexLink>,
}

impl LinkSink {
    fn fresh_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}

fn get_attr<'a>(
    name: &Atom<LocalNameStaticSet>,
    attrs: &'a [Attribute],
) -> Option<&'a str> {
    attrs
        .iter()
        .find(|attr| attr.name.local == *name)
        .map(|attr| attr.value.as_ref())
}

impl TreeSink for LinkSink {
    type Handle = usize;
    type Output = Self;

    // This is where the actual work happens

    fn create_element(
        &mut self,
        name: QualName,
        attrs: Vec<Attribute>,
        _: ElementFlags,
    ) -> usize {
        if name.expanded() == BASE_TAG {
            // HTML spec says that only the first <base> is respected
            if !self.changed_base {
                self.changed_base = true;
                if let Some(new_base_str) = get_attr(&HREF_ATTR, &attrs) {
                    if let Ok(new_base) = self.base.join(new_base_str) {
                        self.base = new_base;
                    }
                }
            }
        }

        if name.expanded() == A_TAG {
            if let Some(url_str) = get_attr(&HREF_ATTR, &attrs) {
                if let Ok(url) = self.base.join(url_str) {
                    let core_metadata = get_attr(CORE_METADATA_ATTR.borrow(), &attrs)
                        .or_else(|| get_attr(DIST_INFO_METADATA_ATTR.borrow(), &attrs))
                        .map(String::from);
                    self.links.push(IndexLink {
                        url,
                        requires_python: get_attr(REQUIRES_PYTHON_ATTR.borrow(), &attrs)
                            .map(String::from),
                        yanked: get_attr(YANKED_ATTR.borrow(), &attrs).map(String::from),
                        core_metadata,
                    });
                }
            }
        }

        let id = self.fresh_id();
        self.names.insert(id, name);
        id
    }

    // Everything else is just boilerplate to make html5ever happy

    fn finish(self) -> Self {
        self
    }

    fn get_document(&mut self) -> usize {
        0
    }

    fn get_template_contents(&mut self, target: &usize) -> usize {
        target + 1
    }

    fn same_node(&self, x: &usize, y: &usize) -> bool {
        x == y
    }

    fn elem_name(&self, target: &usize) -> ExpandedName {
        self.names.get(target).expect("not an element").expanded()
    }

    fn create_comment(&mut self, _text: StrTendril) -> usize {
        self.fresh_id()
    }

    fn create_pi(&mut self, _target: StrTendril, _value: StrTendril) -> usize {
        // HTML doesn't have processing instructions
        unreachable!()
    }

    fn append_before_sibling(&mut self, _sibling: &usize, _new_node: NodeOrText<usize>) {}

    fn append_based_on_parent_node(
        &mut self,
        _element: &usize,
        _prev_element: &usize,
        _new_node: NodeOrText<usize>,
    ) {
    }

    fn parse_error(&mut self, _msg: Cow<'static, str>) {}
    fn set_quirks_mode(&mut self, _mode: QuirksMode) {}
    fn append(&mut self, _parent: &usize, _child: NodeOrText<usize>) {}

    fn append_doctype_to_document(&mut self, _: StrTendril, _: StrTendril, _: StrTendril) {
    }
    // Only called on <html> and <body> tags, which we don't care about
    fn add_attrs_if_missing(&mut self, _target: &usize, _attrs: Vec<Attribute>) {}
    fn remove_from_parent(&mut self, _target: &usize) {}
    fn reparent_children(&mut self, _node: &usize, _new_parent: &usize) {}
    fn mark_script_already_started(&mut self, _node: &usize) {}
}

/// Parse an index page's worth of HTML into its links. `charset` is whatever
/// the Content-Type header claimed; the HTML decoder sniffs from there.
pub fn extract_links(
    base: &Url,
    charset: Option<&str>,
    body: &mut dyn Read,
) -> Result<Vec<IndexLink>> {
    let mut utf8_body = DecodeReaderBytesBuilder::new()
        .encoding(charset.and_then(|label| Encoding::for_label(label.as_bytes())))
        .build(body);

    let sink = LinkSink {
        next_id: 1,
        base: base.clone(),
        changed_base: false,
        names: HashMap::new(),
        links: Vec::new(),
    };
    Ok(parse_document(sink, Default::default())
        .from_utf8()
        .read_from(&mut utf8_body)?
        .links)
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    fn parse(base: &str, body: &str) -> Vec<IndexLink> {
        extract_links(
            &base.parse().unwrap(),
            Some("utf-8"),
            &mut body.as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn test_pep503_page() {
        let links = parse(
            "https://index.example.com/simple/demo/",
            indoc! {r#"
                <!DOCTYPE html>
                <html><body>
                <a href="../../files/demo-1.0.tar.gz#sha256=0011">demo-1.0.tar.gz</a>
                <a href="../../files/demo-1.0-py3-none-any.whl"
                   data-requires-python="&gt;=3.8"
                   data-core-metadata="sha256=ffee">demo-1.0-py3-none-any.whl</a>
                <a href="../../files/demo-0.9.tar.gz" data-yanked="broken metadata">old</a>
                </body></html>
            "#},
        );
        assert_eq!(links.len(), 3);
        assert_eq!(
            links[0].url.as_str(),
            "https://index.example.com/files/demo-1.0.tar.gz#sha256=0011"
        );
        assert_eq!(links[1].requires_python.as_deref(), Some(">=3.8"));
        assert_eq!(links[1].core_metadata.as_deref(), Some("sha256=ffee"));
        assert!(links[1].yanked.is_none());
        assert_eq!(links[2].yanked.as_deref(), Some("broken metadata"));
    }

    #[test]
    fn test_base_tag_rebases_links() {
        let links = parse(
            "https://index.example.com/simple/demo/",
            indoc! {r#"
                <html><head><base href="https://files.example.com/root/"></head>
                <body><a href="demo-1.0.tar.gz">x</a></body></html>
            "#},
        );
        assert_eq!(
            links[0].url.as_str(),
            "https://files.example.com/root/demo-1.0.tar.gz"
        );
    }

    #[test]
    fn test_legacy_dist_info_metadata_attribute() {
        let links = parse(
            "https://index.example.com/simple/demo/",
            r#"<a href="demo-1.0-py3-none-any.whl" data-dist-info-metadata="true">x</a>"#,
        );
        assert_eq!(links[0].core_metadata.as_deref(), Some("true"));
    }
}
