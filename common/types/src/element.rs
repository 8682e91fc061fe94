use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

static SPLIT_CHAIN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:[^\s;"]|"(?:\\.|[^"])*")+"#)
        .expect("hard-coded regular expression to be valid")
});
static SPLIT_CLASS_ATTRIBUTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(.*?)($|:([a-zA-Z\-\_0-9]*=.*))"#)
        .expect("hard-coded regular expression to be valid")
});
static PARSE_ATTRIBUTES_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r#"(?P<attribute>(?P<key>.*?)\=\"(?P<value>.*?[^\\])\")"#)
        .multi_line(true)
        .build()
        .expect("hard-coded regular expression to be valid")
});

/// One HTML element out of a serialized autocapture chain, innermost first.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Element {
    pub order: usize,
    pub text: Option<String>,
    pub tag_name: Option<String>,
    pub href: Option<String>,
    pub attr_id: Option<String>,
    pub attr_class: Vec<String>,
    pub nth_child: Option<u64>,
    pub nth_of_type: Option<u64>,
    pub attributes: HashMap<String, String>,
}

/// Deserialize a chain of HTML elements as serialized by the web client,
/// e.g. `a.link:attr_id="x"nth-child="1";div.container:nth-child="2"`.
pub fn chain_to_elements(chain: &str) -> Vec<Element> {
    SPLIT_CHAIN_REGEX
        .find_iter(chain)
        .enumerate()
        .map(|(order, el_string)| {
            let mut element = Element {
                order,
                ..Default::default()
            };

            let Some(captures) = SPLIT_CLASS_ATTRIBUTES.captures(el_string.as_str()) else {
                return element;
            };

            if let Some(tag_and_classes) = captures.get(1) {
                match tag_and_classes.as_str().split_once('.') {
                    Some((tag, classes)) => {
                        element.tag_name = Some(tag.to_string());
                        element
                            .attr_class
                            .extend(classes.split('.').filter_map(|cl| {
                                (!cl.is_empty()).then(|| cl.to_string())
                            }));
                    }
                    None => element.tag_name = Some(tag_and_classes.as_str().to_string()),
                }
            }

            if let Some(attributes) = captures.get(3) {
                for (_, [_, key, value]) in PARSE_ATTRIBUTES_REGEX
                    .captures_iter(attributes.as_str())
                    .map(|c| c.extract())
                {
                    match key {
                        "href" => element.href = Some(value.to_string()),
                        "text" => element.text = Some(value.to_string()),
                        "attr_id" => element.attr_id = Some(value.to_string()),
                        "nth-child" => element.nth_child = value.parse().ok(),
                        "nth-of-type" => element.nth_of_type = value.parse().ok(),
                        k => {
                            element.attributes.insert(k.to_string(), value.to_string());
                        }
                    };
                }
            }

            element
        })
        .collect()
}
