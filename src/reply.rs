//! Outbound reply values and their XML rendering.

use crate::crypto::Envelope;
use crate::message::{Article, Message};
use crate::signature::unix_timestamp;

/// Neutralise substrings the platform's XML consumer chokes on inside CDATA.
pub fn cdata_escape(value: &str) -> String {
    value.replace("]]>", "]]&gt;").replace("</xml>", "</xml&gt;")
}

/// Addressing header of a reply: swapped sender/recipient plus a timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Postmark {
    pub to_user_name: String,
    pub from_user_name: String,
    pub create_time: u64,
}

impl Postmark {
    pub fn new(
        to_user_name: impl Into<String>,
        from_user_name: impl Into<String>,
        create_time: u64,
    ) -> Self {
        Self {
            to_user_name: to_user_name.into(),
            from_user_name: from_user_name.into(),
            create_time,
        }
    }

    /// Address a reply back to whoever sent `message`, stamped now.
    pub fn reply_to(message: &Message) -> Self {
        Self {
            to_user_name: message.from_user_name.clone().unwrap_or_default(),
            from_user_name: message.to_user_name.clone().unwrap_or_default(),
            create_time: unix_timestamp(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Video {
    pub media_id: String,
    pub title: String,
    pub description: String,
}

impl Video {
    pub fn new(media_id: impl Into<String>) -> Self {
        Self {
            media_id: media_id.into(),
            ..Self::default()
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Music {
    pub thumb_media_id: String,
    pub title: String,
    pub description: String,
    pub music_url: String,
    pub hq_music_url: String,
}

impl Music {
    pub fn new(thumb_media_id: impl Into<String>) -> Self {
        Self {
            thumb_media_id: thumb_media_id.into(),
            ..Self::default()
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn music_url(mut self, url: impl Into<String>) -> Self {
        self.music_url = url.into();
        self
    }

    pub fn hq_music_url(mut self, url: impl Into<String>) -> Self {
        self.hq_music_url = url.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Text(String),
    Image(String),
    Voice(String),
    Video(Video),
    Music(Music),
    News(Vec<Article>),
    Encrypted(Envelope),
}

/// A reply ready to be attached to a request.
///
/// Replies are built unmarked; the request postmarks them when they are
/// attached unless [`Reply::postmarked`] was already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    body: ReplyBody,
    postmark: Option<Postmark>,
}

impl Reply {
    pub fn text(content: impl Into<String>) -> Self {
        ReplyBody::Text(content.into()).into()
    }

    pub fn image(media_id: impl Into<String>) -> Self {
        ReplyBody::Image(media_id.into()).into()
    }

    pub fn voice(media_id: impl Into<String>) -> Self {
        ReplyBody::Voice(media_id.into()).into()
    }

    pub fn video(video: Video) -> Self {
        ReplyBody::Video(video).into()
    }

    pub fn music(music: Music) -> Self {
        ReplyBody::Music(music).into()
    }

    pub fn news(articles: Vec<Article>) -> Self {
        ReplyBody::News(articles).into()
    }

    pub fn encrypted(envelope: Envelope) -> Self {
        ReplyBody::Encrypted(envelope).into()
    }

    pub fn postmarked(mut self, postmark: Postmark) -> Self {
        self.postmark = Some(postmark);
        self
    }

    pub fn postmark(&self) -> Option<&Postmark> {
        self.postmark.as_ref()
    }

    /// Envelopes carry no addressing header and count as marked.
    pub fn is_marked(&self) -> bool {
        self.postmark.is_some() || self.is_encrypted()
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.body, ReplyBody::Encrypted(_))
    }

    pub fn body(&self) -> &ReplyBody {
        &self.body
    }

    pub fn msg_type(&self) -> Option<&'static str> {
        match self.body {
            ReplyBody::Text(_) => Some("text"),
            ReplyBody::Image(_) => Some("image"),
            ReplyBody::Voice(_) => Some("voice"),
            ReplyBody::Video(_) => Some("video"),
            ReplyBody::Music(_) => Some("music"),
            ReplyBody::News(_) => Some("news"),
            ReplyBody::Encrypted(_) => None,
        }
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<xml>");

        if let ReplyBody::Encrypted(envelope) = &self.body {
            push_cdata(&mut xml, "Encrypt", &envelope.encrypt);
            push_cdata(&mut xml, "MsgSignature", &envelope.signature);
            push_plain(&mut xml, "TimeStamp", &envelope.timestamp);
            push_cdata(&mut xml, "Nonce", &envelope.nonce);
            xml.push_str("</xml>");
            return xml;
        }

        let (to_user, from_user, create_time) = match &self.postmark {
            Some(mark) => (
                mark.to_user_name.as_str(),
                mark.from_user_name.as_str(),
                mark.create_time,
            ),
            None => ("", "", 0),
        };
        push_cdata(&mut xml, "ToUserName", to_user);
        push_cdata(&mut xml, "FromUserName", from_user);
        push_plain(&mut xml, "CreateTime", &create_time.to_string());
        push_cdata(&mut xml, "MsgType", self.msg_type().unwrap_or_default());

        match &self.body {
            ReplyBody::Text(content) => push_cdata(&mut xml, "Content", content),
            ReplyBody::Image(media_id) => {
                xml.push_str("<Image>");
                push_cdata(&mut xml, "MediaId", media_id);
                xml.push_str("</Image>");
            }
            ReplyBody::Voice(media_id) => {
                xml.push_str("<Voice>");
                push_cdata(&mut xml, "MediaId", media_id);
                xml.push_str("</Voice>");
            }
            ReplyBody::Video(video) => {
                xml.push_str("<Video>");
                push_cdata(&mut xml, "MediaId", &video.media_id);
                push_optional_cdata(&mut xml, "Title", &video.title);
                push_optional_cdata(&mut xml, "Description", &video.description);
                xml.push_str("</Video>");
            }
            ReplyBody::Music(music) => {
                xml.push_str("<Music>");
                push_optional_cdata(&mut xml, "Title", &music.title);
                push_optional_cdata(&mut xml, "Description", &music.description);
                push_optional_cdata(&mut xml, "MusicUrl", &music.music_url);
                push_optional_cdata(&mut xml, "HQMusicUrl", &music.hq_music_url);
                push_cdata(&mut xml, "ThumbMediaId", &music.thumb_media_id);
                xml.push_str("</Music>");
            }
            ReplyBody::News(articles) => {
                push_plain(&mut xml, "ArticleCount", &articles.len().to_string());
                xml.push_str("<Articles>");
                for article in articles {
                    xml.push_str("<item>");
                    push_cdata(&mut xml, "Title", &article.title);
                    push_cdata(&mut xml, "Description", &article.description);
                    push_cdata(&mut xml, "PicUrl", &article.pic_url);
                    push_cdata(&mut xml, "Url", &article.url);
                    xml.push_str("</item>");
                }
                xml.push_str("</Articles>");
            }
            ReplyBody::Encrypted(_) => {}
        }

        xml.push_str("</xml>");
        xml
    }
}

impl From<ReplyBody> for Reply {
    fn from(body: ReplyBody) -> Self {
        Self {
            body,
            postmark: None,
        }
    }
}

impl From<Envelope> for Reply {
    fn from(envelope: Envelope) -> Self {
        Self::encrypted(envelope)
    }
}

impl From<&str> for Reply {
    fn from(content: &str) -> Self {
        Self::text(content)
    }
}

impl From<String> for Reply {
    fn from(content: String) -> Self {
        Self::text(content)
    }
}

fn push_cdata(xml: &mut String, tag: &str, value: &str) {
    xml.push_str(&format!("<{tag}><![CDATA[{}]]></{tag}>", cdata_escape(value)));
}

fn push_optional_cdata(xml: &mut String, tag: &str, value: &str) {
    if !value.is_empty() {
        push_cdata(xml, tag, value);
    }
}

fn push_plain(xml: &mut String, tag: &str, value: &str) {
    xml.push_str(&format!("<{tag}>{value}</{tag}>"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark() -> Postmark {
        Postmark::new("fromUser", "toUser", 1_700_000_000)
    }

    #[test]
    fn escapes_cdata_terminators() {
        assert_eq!(cdata_escape("a]]>b"), "a]]&gt;b");
        assert_eq!(cdata_escape("x</xml>y"), "x</xml&gt;y");
        assert_eq!(cdata_escape("plain"), "plain");
    }

    #[test]
    fn renders_text_reply() {
        let xml = Reply::text("hi").postmarked(mark()).to_xml();
        assert_eq!(
            xml,
            "<xml><ToUserName><![CDATA[fromUser]]></ToUserName>\
             <FromUserName><![CDATA[toUser]]></FromUserName>\
             <CreateTime>1700000000</CreateTime>\
             <MsgType><![CDATA[text]]></MsgType>\
             <Content><![CDATA[hi]]></Content></xml>"
        );
    }

    #[test]
    fn text_content_is_escaped() {
        let xml = Reply::text("evil]]></xml>").postmarked(mark()).to_xml();
        assert!(xml.contains("<Content><![CDATA[evil]]&gt;</xml&gt;]]></Content>"));
        assert!(xml.ends_with("</Content></xml>"));
    }

    #[test]
    fn media_replies_nest_media_id() {
        let image = Reply::image("m1").postmarked(mark()).to_xml();
        assert!(image.contains("<MsgType><![CDATA[image]]></MsgType>"));
        assert!(image.contains("<Image><MediaId><![CDATA[m1]]></MediaId></Image>"));

        let voice = Reply::voice("m2").postmarked(mark()).to_xml();
        assert!(voice.contains("<Voice><MediaId><![CDATA[m2]]></MediaId></Voice>"));
    }

    #[test]
    fn video_omits_empty_optional_nodes() {
        let bare = Reply::video(Video::new("v1")).to_xml();
        assert!(bare.contains("<Video><MediaId><![CDATA[v1]]></MediaId></Video>"));

        let full = Reply::video(Video::new("v1").title("t").description("d")).to_xml();
        assert!(full.contains(
            "<Video><MediaId><![CDATA[v1]]></MediaId>\
             <Title><![CDATA[t]]></Title>\
             <Description><![CDATA[d]]></Description></Video>"
        ));
    }

    #[test]
    fn music_keeps_thumb_last() {
        let xml = Reply::music(Music::new("thumb").music_url("http://m").title("song")).to_xml();
        assert!(xml.contains(
            "<Music><Title><![CDATA[song]]></Title>\
             <MusicUrl><![CDATA[http://m]]></MusicUrl>\
             <ThumbMediaId><![CDATA[thumb]]></ThumbMediaId></Music>"
        ));
        assert!(!xml.contains("HQMusicUrl"));
    }

    #[test]
    fn news_counts_articles() {
        let reply = Reply::news(vec![
            Article::new("a").url("http://a"),
            Article::new("b").pic_url("http://b.png"),
        ]);
        let xml = reply.to_xml();
        assert!(xml.contains("<ArticleCount>2</ArticleCount>"));
        assert_eq!(xml.matches("<item>").count(), 2);
        assert!(xml.contains("<Url><![CDATA[http://a]]></Url>"));

        let parsed = Message::parse(&xml).unwrap();
        assert_eq!(parsed.articles.len(), 2);
        assert_eq!(parsed.articles[1].pic_url, "http://b.png");
    }

    #[test]
    fn encrypted_reply_has_envelope_shape_only() {
        let reply = Reply::encrypted(Envelope {
            encrypt: "cipher".into(),
            signature: "sig".into(),
            timestamp: "1409304348".into(),
            nonce: "xxxxx".into(),
        });
        assert!(reply.is_marked());
        assert_eq!(reply.msg_type(), None);
        assert_eq!(
            reply.to_xml(),
            "<xml><Encrypt><![CDATA[cipher]]></Encrypt>\
             <MsgSignature><![CDATA[sig]]></MsgSignature>\
             <TimeStamp>1409304348</TimeStamp>\
             <Nonce><![CDATA[xxxxx]]></Nonce></xml>"
        );
    }

    #[test]
    fn reply_to_swaps_addresses() {
        let msg = Message::parse(
            "<xml><ToUserName>me</ToUserName><FromUserName>you</FromUserName></xml>",
        )
        .unwrap();
        let mark = Postmark::reply_to(&msg);
        assert_eq!(mark.to_user_name, "you");
        assert_eq!(mark.from_user_name, "me");
        assert!(mark.create_time > 0);
        assert!(!Reply::text("x").is_marked());
    }
}
