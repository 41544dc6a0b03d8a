//! EWS `FindItem` and `GetItem` for the service account's calendar.
//!
//! `FindItem` with a `CalendarView` expands recurring meetings but only
//! returns ids here; attendee lists need a second `GetItem` round trip.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, warn};

use crate::account::{AccountItem, Attendee, ResponseType};
use crate::error::{UpstreamError, UpstreamResult};

use super::ews::{SoapWriter, error_for_response_code, fault_error, parse_ews_time};

/// EWS answer for an id that does not resolve to an item.
pub const ITEM_NOT_FOUND: &str = "ErrorItemNotFound";
const INVALID_ID_CODES: [&str; 3] = [
    ITEM_NOT_FOUND,
    "ErrorInvalidIdMalformed",
    "ErrorInvalidIdNotAnItemAttachmentId",
];

const CALENDAR_FIELDS: [&str; 4] = [
    "item:Subject",
    "calendar:Start",
    "calendar:End",
    "calendar:RequiredAttendees",
];

/// Builds a `FindItem` over the default calendar folder.
pub fn find_items_request(start: DateTime<Utc>, end: DateTime<Utc>) -> UpstreamResult<String> {
    write_find_items(start, end).map_err(|e| {
        UpstreamError::malformed(format!("failed to build FindItem request: {e}")).with_source(e)
    })
}

fn write_find_items(start: DateTime<Utc>, end: DateTime<Utc>) -> std::io::Result<String> {
    let start = start.format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let end = end.format("%Y-%m-%dT%H:%M:%SZ").to_string();

    let mut w = SoapWriter::begin()?;
    w.start_with("m:FindItem", &[("Traversal", "Shallow")])?;
    w.start("m:ItemShape")?;
    w.text_element("t:BaseShape", "IdOnly")?;
    w.end("m:ItemShape")?;
    w.empty("m:CalendarView", &[("StartDate", &start), ("EndDate", &end)])?;
    w.start("m:ParentFolderIds")?;
    w.empty("t:DistinguishedFolderId", &[("Id", "calendar")])?;
    w.end("m:ParentFolderIds")?;
    w.end("m:FindItem")?;
    w.finish()
}

/// Builds a `GetItem` for subject, times and required attendees.
pub fn get_items_request<S: AsRef<str>>(item_ids: &[S]) -> UpstreamResult<String> {
    write_get_items(item_ids).map_err(|e| {
        UpstreamError::malformed(format!("failed to build GetItem request: {e}")).with_source(e)
    })
}

fn write_get_items<S: AsRef<str>>(item_ids: &[S]) -> std::io::Result<String> {
    let mut w = SoapWriter::begin()?;
    w.start("m:GetItem")?;
    w.start("m:ItemShape")?;
    w.text_element("t:BaseShape", "IdOnly")?;
    w.start("t:AdditionalProperties")?;
    for field in CALENDAR_FIELDS {
        w.empty("t:FieldURI", &[("FieldURI", field)])?;
    }
    w.end("t:AdditionalProperties")?;
    w.end("m:ItemShape")?;
    w.start("m:ItemIds")?;
    for id in item_ids {
        w.empty("t:ItemId", &[("Id", id.as_ref())])?;
    }
    w.end("m:ItemIds")?;
    w.end("m:GetItem")?;
    w.finish()
}

/// Outcome of one `GetItemResponseMessage`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemMessage {
    Found(AccountItem),
    Failed { code: String, message: String },
}

impl ItemMessage {
    /// Whether the failure means the id names no item.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Failed { code, .. } if INVALID_ID_CODES.contains(&code.as_str()))
    }
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn invalid_xml(xml: &str, position: u64, e: quick_xml::Error) -> UpstreamError {
    UpstreamError::malformed(format!("invalid XML at position {position}: {e}"))
        .with_payload(xml)
        .with_source(e)
}

/// Reads item ids out of a `FindItemResponse`.
pub fn parse_find_items_response(xml: &str) -> UpstreamResult<Vec<String>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut ids = Vec::new();
    let mut current: Option<String> = None;
    let mut response_class: Option<String> = None;
    let mut response_code: Option<String> = None;
    let mut message_text: Option<String> = None;
    let mut fault: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = local_name(&e);
                match name.as_str() {
                    "FindItemResponseMessage" => response_class = attribute(&e, "ResponseClass"),
                    "ItemId" => ids.extend(attribute(&e, "Id")),
                    _ => {}
                }
                current = Some(name);
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default().into_owned();
                match current.as_deref() {
                    Some("ResponseCode") => response_code = Some(text),
                    Some("MessageText") => message_text = Some(text),
                    Some("faultstring") => fault = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(invalid_xml(xml, reader.buffer_position(), e)),
        }
        buf.clear();
    }

    if let Some(fault) = fault {
        return Err(fault_error(response_code.as_deref(), &fault).with_payload(xml));
    }
    match response_class.as_deref() {
        Some("Error") => {
            let code = response_code.unwrap_or_else(|| "ErrorUnknown".to_string());
            Err(error_for_response_code(&code, message_text.as_deref().unwrap_or_default())
                .with_payload(xml))
        }
        Some(_) => {
            debug!(count = ids.len(), "found calendar items");
            Ok(ids)
        }
        None => Err(
            UpstreamError::malformed("response carries no FindItem response message")
                .with_payload(xml),
        ),
    }
}

#[derive(Debug, Default)]
struct PendingItem {
    id: Option<String>,
    subject: Option<String>,
    start: Option<String>,
    end: Option<String>,
    attendees: Vec<Attendee>,
}

impl PendingItem {
    fn finish(self) -> Option<AccountItem> {
        let Some(item_id) = self.id else {
            warn!("calendar item without id, skipping");
            return None;
        };
        let times = self
            .start
            .as_deref()
            .and_then(parse_ews_time)
            .zip(self.end.as_deref().and_then(parse_ews_time));
        let Some((start, end)) = times else {
            warn!(%item_id, "calendar item without usable start or end, skipping");
            return None;
        };
        Some(AccountItem {
            item_id,
            subject: self.subject.filter(|s| !s.trim().is_empty()),
            start,
            end,
            attendees: self.attendees,
        })
    }
}

#[derive(Debug, Default)]
struct PendingAttendee {
    email: Option<String>,
    response: ResponseType,
}

#[derive(Debug, Default)]
struct PendingMessage {
    class: Option<String>,
    code: Option<String>,
    text: Option<String>,
    item: Option<AccountItem>,
}

impl PendingMessage {
    fn finish(self) -> ItemMessage {
        match (self.class.as_deref(), self.item) {
            (Some("Error"), _) | (_, None) => ItemMessage::Failed {
                code: self.code.unwrap_or_else(|| "ErrorUnknown".to_string()),
                message: self.text.unwrap_or_default(),
            },
            (_, Some(item)) => ItemMessage::Found(item),
        }
    }
}

/// Reads a `GetItemResponse`, one [`ItemMessage`] per requested id.
///
/// A SOAP fault fails the whole response.
pub fn parse_get_items_response(xml: &str) -> UpstreamResult<Vec<ItemMessage>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut messages = Vec::new();
    let mut message: Option<PendingMessage> = None;
    let mut item: Option<PendingItem> = None;
    let mut attendee: Option<PendingAttendee> = None;
    let mut fault: Option<String> = None;
    let mut fault_code: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(&e);
                match name.as_str() {
                    "GetItemResponseMessage" => {
                        message = Some(PendingMessage {
                            class: attribute(&e, "ResponseClass"),
                            ..PendingMessage::default()
                        });
                    }
                    "CalendarItem" => item = Some(PendingItem::default()),
                    "Attendee" => attendee = Some(PendingAttendee::default()),
                    _ => {}
                }
                path.push(name);
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"ItemId"
                    && let Some(item) = item.as_mut()
                {
                    item.id = attribute(&e, "Id");
                }
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Attendee" => {
                        if let Some(pending) = attendee.take()
                            && let (Some(item), Some(email)) = (item.as_mut(), pending.email)
                        {
                            item.attendees.push(Attendee::new(email, pending.response));
                        }
                    }
                    b"CalendarItem" => {
                        if let Some(message) = message.as_mut() {
                            message.item = item.take().and_then(PendingItem::finish);
                        }
                    }
                    b"GetItemResponseMessage" => {
                        messages.extend(message.take().map(PendingMessage::finish));
                    }
                    _ => {}
                }
                path.pop();
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default().into_owned();
                let Some(current) = path.last().map(String::as_str) else {
                    continue;
                };
                let parent = path.len().checked_sub(2).map(|i| path[i].as_str());
                match current {
                    "EmailAddress" => {
                        if let Some(attendee) = attendee.as_mut() {
                            attendee.email = Some(text);
                        }
                    }
                    "ResponseType" => {
                        if let Some(attendee) = attendee.as_mut() {
                            attendee.response = ResponseType::parse(&text);
                        }
                    }
                    "Subject" | "Start" | "End" if parent == Some("CalendarItem") => {
                        if let Some(item) = item.as_mut() {
                            let slot = match current {
                                "Subject" => &mut item.subject,
                                "Start" => &mut item.start,
                                _ => &mut item.end,
                            };
                            *slot = Some(text);
                        }
                    }
                    "ResponseCode" => match message.as_mut() {
                        Some(message) => message.code = Some(text),
                        None => fault_code = Some(text),
                    },
                    "MessageText" => {
                        if let Some(message) = message.as_mut() {
                            message.text = Some(text);
                        }
                    }
                    "faultstring" => fault = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(invalid_xml(xml, reader.buffer_position(), e)),
        }
        buf.clear();
    }

    if let Some(fault) = fault {
        return Err(fault_error(fault_code.as_deref(), &fault).with_payload(xml));
    }
    if messages.is_empty() {
        return Err(
            UpstreamError::malformed("response carries no GetItem response message")
                .with_payload(xml),
        );
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamErrorCode;
    use chrono::TimeZone;

    fn utc(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, d, h, 0, 0).unwrap()
    }

    fn envelope(body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body
 xmlns:m="http://schemas.microsoft.com/exchange/services/2006/messages"
 xmlns:t="http://schemas.microsoft.com/exchange/services/2006/types">{body}</s:Body></s:Envelope>"#
        )
    }

    fn calendar_item(id: &str, attendees: &[(&str, &str)]) -> String {
        let attendees: String = attendees
            .iter()
            .map(|(email, response)| {
                format!(
                    "<t:Attendee><t:Mailbox><t:Name>x</t:Name><t:EmailAddress>{email}</t:EmailAddress>\
<t:RoutingType>SMTP</t:RoutingType></t:Mailbox><t:ResponseType>{response}</t:ResponseType></t:Attendee>"
                )
            })
            .collect();
        format!(
            r#"<t:CalendarItem><t:ItemId Id="{id}" ChangeKey="ck"/><t:Subject>Thesis defence</t:Subject>
<t:Start>2025-03-03T09:00:00Z</t:Start><t:End>2025-03-03T10:30:00Z</t:End>
<t:RequiredAttendees>{attendees}</t:RequiredAttendees></t:CalendarItem>"#
        )
    }

    #[test]
    fn find_request_covers_calendar_view() {
        let xml = find_items_request(utc(3, 0), utc(10, 0)).unwrap();
        assert!(xml.contains(r#"<m:FindItem Traversal="Shallow">"#));
        assert!(xml.contains(
            r#"<m:CalendarView StartDate="2025-03-03T00:00:00Z" EndDate="2025-03-10T00:00:00Z"/>"#
        ));
        assert!(xml.contains(r#"<t:DistinguishedFolderId Id="calendar"/>"#));
        assert!(xml.ends_with("</soap:Body></soap:Envelope>"));
    }

    #[test]
    fn get_request_lists_fields_and_escaped_ids() {
        let xml = get_items_request(&["AAMk+1=", "a&b"]).unwrap();
        assert!(xml.contains(r#"<t:FieldURI FieldURI="calendar:RequiredAttendees"/>"#));
        assert!(xml.contains(r#"<t:ItemId Id="AAMk+1="/>"#));
        assert!(xml.contains(r#"<t:ItemId Id="a&amp;b"/>"#));
    }

    #[test]
    fn find_response_yields_ids() {
        let xml = envelope(
            r#"<m:FindItemResponse><m:ResponseMessages>
<m:FindItemResponseMessage ResponseClass="Success"><m:ResponseCode>NoError</m:ResponseCode>
<m:RootFolder TotalItemsInView="2" IncludesLastItemInRange="true"><t:Items>
<t:CalendarItem><t:ItemId Id="A1" ChangeKey="x"/></t:CalendarItem>
<t:CalendarItem><t:ItemId Id="A2" ChangeKey="y"/></t:CalendarItem>
</t:Items></m:RootFolder></m:FindItemResponseMessage>
</m:ResponseMessages></m:FindItemResponse>"#,
        );
        assert_eq!(parse_find_items_response(&xml).unwrap(), vec!["A1", "A2"]);
    }

    #[test]
    fn find_error_message_maps_response_code() {
        let xml = envelope(
            r#"<m:FindItemResponse><m:ResponseMessages>
<m:FindItemResponseMessage ResponseClass="Error"><m:MessageText>no access</m:MessageText>
<m:ResponseCode>ErrorAccessDenied</m:ResponseCode></m:FindItemResponseMessage>
</m:ResponseMessages></m:FindItemResponse>"#,
        );
        let err = parse_find_items_response(&xml).unwrap_err();
        assert_eq!(err.code(), UpstreamErrorCode::Auth);
        assert!(err.message().contains("no access"));
    }

    #[test]
    fn get_response_reads_items_and_failures() {
        let xml = envelope(&format!(
            r#"<m:GetItemResponse><m:ResponseMessages>
<m:GetItemResponseMessage ResponseClass="Success"><m:ResponseCode>NoError</m:ResponseCode>
<m:Items>{}</m:Items></m:GetItemResponseMessage>
<m:GetItemResponseMessage ResponseClass="Error"><m:MessageText>gone</m:MessageText>
<m:ResponseCode>ErrorItemNotFound</m:ResponseCode><m:Items/></m:GetItemResponseMessage>
</m:ResponseMessages></m:GetItemResponse>"#,
            calendar_item(
                "A1",
                &[("svc@uni.example", "Organizer"), ("R301@uni.example", "Decline")]
            )
        ));
        let messages = parse_get_items_response(&xml).unwrap();
        assert_eq!(messages.len(), 2);

        let ItemMessage::Found(item) = &messages[0] else {
            panic!("expected an item, got {:?}", messages[0]);
        };
        assert_eq!(item.item_id, "A1");
        assert_eq!(item.subject.as_deref(), Some("Thesis defence"));
        assert_eq!(item.start, utc(3, 9));
        assert_eq!(item.end, utc(3, 10) + chrono::Duration::minutes(30));
        assert_eq!(item.attendees.len(), 2);
        assert_eq!(
            item.attendee("r301@uni.example").map(|a| a.response),
            Some(ResponseType::Decline)
        );

        assert!(messages[1].is_missing());
        assert!(!messages[0].is_missing());
    }

    #[test]
    fn get_fault_fails_everything() {
        let xml = envelope(
            r#"<s:Fault><faultcode>a:ErrorServerBusy</faultcode><faultstring>busy</faultstring>
<detail><e:ResponseCode xmlns:e="http://schemas.microsoft.com/exchange/services/2006/errors">ErrorServerBusy</e:ResponseCode></detail></s:Fault>"#,
        );
        let err = parse_get_items_response(&xml).unwrap_err();
        assert_eq!(err.code(), UpstreamErrorCode::Unavailable);
    }

    #[test]
    fn empty_get_response_is_malformed() {
        let err = parse_get_items_response(&envelope("<m:GetItemResponse/>")).unwrap_err();
        assert_eq!(err.code(), UpstreamErrorCode::Malformed);
    }
}
