//! EWS `GetUserAvailability` request building and response parsing.
//!
//! The request asks for the detailed free/busy view of a single room
//! mailbox. Times are exchanged in UTC: the request carries a zero-bias
//! `TimeZone`, so Exchange answers with offset-less timestamps that are
//! read back as UTC.

use std::io::Cursor;

use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use roombook_core::TimeWindow;
use tracing::{debug, warn};

use crate::error::{UpstreamError, UpstreamResult};
use crate::raw_event::{BusyStatus, RawEvent};

pub const SOAP_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const TYPES_NS: &str = "http://schemas.microsoft.com/exchange/services/2006/types";
pub const MESSAGES_NS: &str = "http://schemas.microsoft.com/exchange/services/2006/messages";

const EWS_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const SERVER_VERSION: &str = "Exchange2010_SP1";

/// Builds the SOAP envelope for one mailbox.
pub fn availability_request(
    mailbox: &str,
    window: &TimeWindow,
    merged_interval_minutes: u32,
) -> UpstreamResult<String> {
    write_availability_request(mailbox, window, merged_interval_minutes).map_err(|e| {
        UpstreamError::malformed(format!("failed to build availability request: {e}"))
            .with_source(e)
    })
}

fn write_availability_request(
    mailbox: &str,
    window: &TimeWindow,
    merged_interval_minutes: u32,
) -> std::io::Result<String> {
    let mut w = SoapWriter::begin()?;
    w.start("m:GetUserAvailabilityRequest")?;

    // Zero-bias zone: timestamps in both directions are UTC.
    w.start("t:TimeZone")?;
    w.text_element("t:Bias", "0")?;
    for transition in ["t:StandardTime", "t:DaylightTime"] {
        w.start(transition)?;
        w.text_element("t:Bias", "0")?;
        w.text_element("t:Time", "00:00:00")?;
        w.text_element("t:DayOrder", "1")?;
        w.text_element("t:Month", "1")?;
        w.text_element("t:DayOfWeek", "Sunday")?;
        w.end(transition)?;
    }
    w.end("t:TimeZone")?;

    w.start("m:MailboxDataArray")?;
    w.start("t:MailboxData")?;
    w.start("t:Email")?;
    w.text_element("t:Address", mailbox)?;
    w.end("t:Email")?;
    w.text_element("t:AttendeeType", "Resource")?;
    w.text_element("t:ExcludeConflicts", "false")?;
    w.end("t:MailboxData")?;
    w.end("m:MailboxDataArray")?;

    w.start("t:FreeBusyViewOptions")?;
    w.start("t:TimeWindow")?;
    w.text_element("t:StartTime", &format_ews_time(window.start))?;
    w.text_element("t:EndTime", &format_ews_time(window.end))?;
    w.end("t:TimeWindow")?;
    w.text_element(
        "t:MergedFreeBusyIntervalInMinutes",
        &merged_interval_minutes.to_string(),
    )?;
    w.text_element("t:RequestedView", "Detailed")?;
    w.end("t:FreeBusyViewOptions")?;

    w.end("m:GetUserAvailabilityRequest")?;
    w.finish()
}

/// Writes one SOAP envelope with the EWS namespaces and server version.
pub(super) struct SoapWriter {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl SoapWriter {
    /// Writes everything up to and including `<soap:Body>`.
    pub(super) fn begin() -> std::io::Result<Self> {
        let mut w = Self {
            writer: Writer::new(Cursor::new(Vec::new())),
        };
        w.writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

        let mut envelope = BytesStart::new("soap:Envelope");
        envelope.push_attribute(("xmlns:soap", SOAP_NS));
        envelope.push_attribute(("xmlns:t", TYPES_NS));
        envelope.push_attribute(("xmlns:m", MESSAGES_NS));
        w.writer.write_event(Event::Start(envelope))?;

        w.start("soap:Header")?;
        w.empty("t:RequestServerVersion", &[("Version", SERVER_VERSION)])?;
        w.end("soap:Header")?;
        w.start("soap:Body")?;
        Ok(w)
    }

    pub(super) fn start(&mut self, name: &str) -> std::io::Result<()> {
        self.writer.write_event(Event::Start(BytesStart::new(name)))
    }

    pub(super) fn start_with(&mut self, name: &str, attrs: &[(&str, &str)]) -> std::io::Result<()> {
        let mut start = BytesStart::new(name);
        start.extend_attributes(attrs.iter().copied());
        self.writer.write_event(Event::Start(start))
    }

    pub(super) fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> std::io::Result<()> {
        let mut element = BytesStart::new(name);
        element.extend_attributes(attrs.iter().copied());
        self.writer.write_event(Event::Empty(element))
    }

    pub(super) fn end(&mut self, name: &str) -> std::io::Result<()> {
        self.writer.write_event(Event::End(BytesEnd::new(name)))
    }

    pub(super) fn text_element(&mut self, name: &str, text: &str) -> std::io::Result<()> {
        self.start(name)?;
        self.writer.write_event(Event::Text(BytesText::new(text)))?;
        self.end(name)
    }

    /// Closes body and envelope.
    pub(super) fn finish(mut self) -> std::io::Result<String> {
        self.end("soap:Body")?;
        self.end("soap:Envelope")?;
        String::from_utf8(self.writer.into_inner().into_inner())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

fn format_ews_time(dt: DateTime<Utc>) -> String {
    dt.format(EWS_TIME_FORMAT).to_string()
}

/// Reads an EWS timestamp. Offset-less values are UTC.
pub(super) fn parse_ews_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, EWS_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Default)]
struct PendingEvent {
    start: Option<String>,
    end: Option<String>,
    busy_type: Option<String>,
    subject: Option<String>,
    id: Option<String>,
}

impl PendingEvent {
    fn finish(self) -> Option<RawEvent> {
        let (Some(start), Some(end)) = (self.start.as_deref(), self.end.as_deref()) else {
            warn!("calendar event without start or end, skipping");
            return None;
        };
        let (Some(start), Some(end)) = (parse_ews_time(start), parse_ews_time(end)) else {
            warn!(start, end, "unparseable calendar event times, skipping");
            return None;
        };

        let mut event = RawEvent::busy(start, end).with_busy_status(
            self.busy_type
                .as_deref()
                .map(BusyStatus::parse)
                .unwrap_or_default(),
        );
        if let Some(subject) = self.subject.filter(|s| !s.trim().is_empty()) {
            event = event.with_subject(subject);
        }
        if let Some(id) = self.id {
            event = event.with_uid(id);
        }
        Some(event)
    }
}

/// Parses a `GetUserAvailabilityResponse` into raw events.
///
/// An error response message or SOAP fault becomes an [`UpstreamError`]
/// carrying an excerpt of the payload.
pub fn parse_availability_response(xml: &str) -> UpstreamResult<Vec<RawEvent>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut events = Vec::new();
    let mut pending: Option<PendingEvent> = None;
    let mut response_class: Option<String> = None;
    let mut response_code: Option<String> = None;
    let mut message_text: Option<String> = None;
    let mut fault: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match name.as_str() {
                    "CalendarEvent" => pending = Some(PendingEvent::default()),
                    "ResponseMessage" => {
                        if let Ok(Some(attr)) = e.try_get_attribute("ResponseClass") {
                            response_class =
                                attr.unescape_value().ok().map(|v| v.into_owned());
                        }
                    }
                    _ => {}
                }
                path.push(name);
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"ResponseMessage"
                    && let Ok(Some(attr)) = e.try_get_attribute("ResponseClass")
                {
                    response_class = attr.unescape_value().ok().map(|v| v.into_owned());
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "CalendarEvent"
                    && let Some(event) = pending.take().and_then(PendingEvent::finish)
                {
                    events.push(event);
                }
                path.pop();
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default().into_owned();
                let Some(current) = path.last().map(String::as_str) else {
                    continue;
                };
                let parent = path.len().checked_sub(2).map(|i| path[i].as_str());
                match (current, pending.as_mut()) {
                    ("StartTime", Some(ev)) if parent == Some("CalendarEvent") => {
                        ev.start = Some(text)
                    }
                    ("EndTime", Some(ev)) if parent == Some("CalendarEvent") => {
                        ev.end = Some(text)
                    }
                    ("BusyType", Some(ev)) => ev.busy_type = Some(text),
                    ("Subject", Some(ev)) => ev.subject = Some(text),
                    ("ID", Some(ev)) => ev.id = Some(text),
                    ("ResponseCode", _) => response_code = Some(text),
                    ("MessageText", _) => message_text = Some(text),
                    ("faultstring", _) => fault = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(UpstreamError::malformed(format!(
                    "invalid XML at position {}: {e}",
                    reader.buffer_position()
                ))
                .with_payload(xml)
                .with_source(e));
            }
        }
        buf.clear();
    }

    if let Some(fault) = fault {
        return Err(fault_error(response_code.as_deref(), &fault).with_payload(xml));
    }
    if response_class.as_deref() == Some("Error") {
        let code = response_code.unwrap_or_else(|| "ErrorUnknown".to_string());
        let message = message_text.unwrap_or_default();
        return Err(error_for_response_code(&code, &message).with_payload(xml));
    }
    if response_class.is_none() {
        return Err(
            UpstreamError::malformed("response carries no free/busy response message")
                .with_payload(xml),
        );
    }

    debug!(count = events.len(), "parsed free/busy events");
    Ok(events)
}

/// Reads a SOAP fault out of `xml`, if it is one.
///
/// The EWS `ResponseCode` in the fault detail decides the error kind;
/// faults without one are malformed.
pub fn parse_soap_fault(xml: &str) -> Option<UpstreamError> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut current: Option<String> = None;
    let mut fault: Option<String> = None;
    let mut response_code: Option<String> = None;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                current = Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default().into_owned();
                match current.as_deref() {
                    Some("faultstring") => fault = Some(text),
                    Some("ResponseCode") => response_code = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            Ok(_) => {}
        }
        buf.clear();
    }
    fault.map(|fault| fault_error(response_code.as_deref(), &fault))
}

pub(super) fn fault_error(response_code: Option<&str>, fault: &str) -> UpstreamError {
    match response_code {
        Some(code) => error_for_response_code(code, fault),
        None => UpstreamError::malformed(format!("SOAP fault: {fault}")),
    }
}

/// Maps an EWS `ResponseCode` onto the error taxonomy.
pub(super) fn error_for_response_code(code: &str, message: &str) -> UpstreamError {
    let text = if message.is_empty() {
        code.to_string()
    } else {
        format!("{code}: {message}")
    };
    match code {
        "ErrorAccessDenied" | "ErrorImpersonationDenied" | "ErrorNonExistentMailbox" => {
            UpstreamError::auth(text)
        }
        "ErrorServerBusy" | "ErrorTimeoutExpired" | "ErrorMailboxStoreUnavailable" => {
            UpstreamError::unavailable(text)
        }
        _ => UpstreamError::malformed(text),
    }
}
