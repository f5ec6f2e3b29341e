//! Inbound callback messages.
//!
//! Only the children of the `<xml>` root are read as fields. `Articles/item`
//! is the one nested list the platform sends; any other nested element is
//! kept in [`Message::extra`] under its dotted path (`Image.MediaId`).

use crate::error::{Result, WeixinError};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;

const ROOT_ELEMENT: &str = "xml";
const ARTICLES_ELEMENT: &str = "Articles";
const ARTICLE_ITEM_ELEMENT: &str = "item";

/// One entry of a news (`Articles`) payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Article {
    pub title: String,
    pub description: String,
    pub pic_url: String,
    pub url: String,
}

impl Article {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn pic_url(mut self, pic_url: impl Into<String>) -> Self {
        self.pic_url = pic_url.into();
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    fn from_fields(fields: BTreeMap<String, String>) -> Self {
        let mut fields = fields;
        let mut take = |name: &str| fields.remove(name).unwrap_or_default();
        Self {
            title: take("Title"),
            description: take("Description"),
            pic_url: take("PicUrl"),
            url: take("Url"),
        }
    }
}

/// A parsed callback body. Absent fields are `None`, never an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub to_user_name: Option<String>,
    pub from_user_name: Option<String>,
    pub create_time: Option<String>,
    pub msg_type: Option<String>,
    pub msg_id: Option<String>,
    pub content: Option<String>,
    pub media_id: Option<String>,
    pub pic_url: Option<String>,
    pub format: Option<String>,
    pub recognition: Option<String>,
    pub thumb_media_id: Option<String>,
    pub location_x: Option<String>,
    pub location_y: Option<String>,
    pub scale: Option<String>,
    pub label: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub event: Option<String>,
    pub event_key: Option<String>,
    pub scene: Option<String>,
    pub ticket: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub precision: Option<String>,
    pub encrypt: Option<String>,
    pub articles: Vec<Article>,
    /// Fields without a typed slot, in document order.
    pub extra: Vec<(String, String)>,
}

impl Message {
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut message = Message::default();
        let mut path: Vec<String> = Vec::new();
        // Parallel to `path`: whether each open element has child elements.
        let mut nested: Vec<bool> = Vec::new();
        let mut text = String::new();
        let mut article: Option<BTreeMap<String, String>> = None;
        let mut seen_root = false;

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(start) => {
                    let name = element_name(start.local_name().as_ref())?;
                    if path.is_empty() {
                        check_root(&name, &mut seen_root)?;
                    } else if is_article_item(&path, &name) {
                        article = Some(BTreeMap::new());
                    }
                    if let Some(parent) = nested.last_mut() {
                        *parent = true;
                    }
                    path.push(name);
                    nested.push(false);
                    text.clear();
                }
                Event::Empty(empty) => {
                    let name = element_name(empty.local_name().as_ref())?;
                    if path.is_empty() {
                        check_root(&name, &mut seen_root)?;
                        continue;
                    }
                    if let Some(parent) = nested.last_mut() {
                        *parent = true;
                    }
                    path.push(name);
                    message.close_element(&path, String::new(), false, &mut article);
                    path.pop();
                }
                Event::Text(raw) => {
                    let unescaped = raw.unescape().map_err(xml_error)?;
                    text.push_str(&unescaped);
                }
                Event::CData(cdata) => {
                    let value = String::from_utf8(cdata.into_inner().into_owned())
                        .map_err(|_| WeixinError::decode("CDATA section is not utf-8"))?;
                    text.push_str(&value);
                }
                Event::End(_) => {
                    let wrapper = nested.pop().unwrap_or(false);
                    message.close_element(&path, std::mem::take(&mut text), wrapper, &mut article);
                    path.pop();
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !seen_root {
            return Err(WeixinError::decode("missing <xml> root element"));
        }
        if !path.is_empty() {
            return Err(WeixinError::decode(format!("unclosed <{}> element", path.join("/"))));
        }
        Ok(message)
    }

    /// Look a field up by its wire name.
    pub fn field(&self, name: &str) -> Option<&str> {
        let typed = match name {
            "ToUserName" => &self.to_user_name,
            "FromUserName" => &self.from_user_name,
            "CreateTime" => &self.create_time,
            "MsgType" => &self.msg_type,
            "MsgId" => &self.msg_id,
            "Content" => &self.content,
            "MediaId" => &self.media_id,
            "PicUrl" => &self.pic_url,
            "Format" => &self.format,
            "Recognition" => &self.recognition,
            "ThumbMediaId" => &self.thumb_media_id,
            "Location_X" => &self.location_x,
            "Location_Y" => &self.location_y,
            "Scale" => &self.scale,
            "Label" => &self.label,
            "Title" => &self.title,
            "Description" => &self.description,
            "Url" => &self.url,
            "Event" => &self.event,
            "EventKey" => &self.event_key,
            "Scene" => &self.scene,
            "Ticket" => &self.ticket,
            "Latitude" => &self.latitude,
            "Longitude" => &self.longitude,
            "Precision" => &self.precision,
            "Encrypt" => &self.encrypt,
            _ => {
                return self
                    .extra
                    .iter()
                    .find(|(key, _)| key == name)
                    .map(|(_, value)| value.as_str())
            }
        };
        typed.as_deref()
    }

    pub fn content_or_empty(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Encrypted bodies carry little besides `Encrypt`; an empty one counts as absent.
    pub fn encrypted_payload(&self) -> Option<&str> {
        self.encrypt.as_deref().filter(|value| !value.is_empty())
    }

    fn slot_mut(&mut self, name: &str) -> Option<&mut Option<String>> {
        let slot = match name {
            "ToUserName" => &mut self.to_user_name,
            "FromUserName" => &mut self.from_user_name,
            "CreateTime" => &mut self.create_time,
            "MsgType" => &mut self.msg_type,
            "MsgId" => &mut self.msg_id,
            "Content" => &mut self.content,
            "MediaId" => &mut self.media_id,
            "PicUrl" => &mut self.pic_url,
            "Format" => &mut self.format,
            "Recognition" => &mut self.recognition,
            "ThumbMediaId" => &mut self.thumb_media_id,
            "Location_X" => &mut self.location_x,
            "Location_Y" => &mut self.location_y,
            "Scale" => &mut self.scale,
            "Label" => &mut self.label,
            "Title" => &mut self.title,
            "Description" => &mut self.description,
            "Url" => &mut self.url,
            "Event" => &mut self.event,
            "EventKey" => &mut self.event_key,
            "Scene" => &mut self.scene,
            "Ticket" => &mut self.ticket,
            "Latitude" => &mut self.latitude,
            "Longitude" => &mut self.longitude,
            "Precision" => &mut self.precision,
            "Encrypt" => &mut self.encrypt,
            _ => return None,
        };
        Some(slot)
    }

    fn set_field(&mut self, name: &str, value: String) {
        match self.slot_mut(name) {
            Some(slot) => *slot = Some(value),
            None => self.extra.push((name.to_string(), value)),
        }
    }

    fn close_element(
        &mut self,
        path: &[String],
        value: String,
        wrapper: bool,
        article: &mut Option<BTreeMap<String, String>>,
    ) {
        let in_articles = path.get(1).is_some_and(|name| name == ARTICLES_ELEMENT);
        match path.len() {
            0 | 1 => {}
            2 if in_articles || wrapper => {}
            2 => self.set_field(&path[1], value),
            3 if in_articles && path[2] == ARTICLE_ITEM_ELEMENT => {
                if let Some(fields) = article.take() {
                    self.articles.push(Article::from_fields(fields));
                }
            }
            4 if in_articles && path[2] == ARTICLE_ITEM_ELEMENT => {
                if let Some(fields) = article.as_mut() {
                    fields.insert(path[3].clone(), value);
                }
            }
            _ => {
                if !value.is_empty() {
                    self.extra.push((path[1..].join("."), value));
                }
            }
        }
    }
}

fn is_article_item(path: &[String], name: &str) -> bool {
    path.len() == 2 && path[1] == ARTICLES_ELEMENT && name == ARTICLE_ITEM_ELEMENT
}

fn check_root(name: &str, seen_root: &mut bool) -> Result<()> {
    if *seen_root {
        return Err(WeixinError::decode("more than one root element"));
    }
    if name != ROOT_ELEMENT {
        return Err(WeixinError::decode(format!(
            "unexpected root element <{name}>, expected <{ROOT_ELEMENT}>"
        )));
    }
    *seen_root = true;
    Ok(())
}

fn element_name(raw: &[u8]) -> Result<String> {
    std::str::from_utf8(raw)
        .map(ToOwned::to_owned)
        .map_err(|_| WeixinError::decode("element name is not utf-8"))
}

fn xml_error(err: quick_xml::Error) -> WeixinError {
    WeixinError::decode(format!("malformed xml: {err}"))
}
