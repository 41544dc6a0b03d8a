//! Parsing of published room calendars (RFC 5545).
//!
//! Exchange publishes room calendars as ICS feeds. Each `VEVENT` becomes a
//! [`RawEvent`]; events that cannot be interpreted are skipped so one bad
//! entry never hides the rest of the room's schedule.
//!
//! Recurring series (`RRULE`, `RDATE`, `EXDATE`) are expanded with the
//! `rrule` crate, restricted to the query window. An instance replaced by a
//! `RECURRENCE-ID` override is taken from the override instead.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use icalendar::{
    Calendar, CalendarComponent, CalendarDateTime, Component, DatePerhapsTime, Event,
    EventStatus, Property,
};
use roombook_core::TimeWindow;
use rrule::{RRule, RRuleSet, Unvalidated};
use tracing::{debug, warn};

use crate::error::{UpstreamError, UpstreamResult};
use crate::raw_event::{BusyStatus, RawEvent, RawEventTime};

const CDO_BUSY_STATUS: &str = "X-MICROSOFT-CDO-BUSYSTATUS";

/// Upper bound on instances taken from one series per query.
const MAX_INSTANCES: u16 = 1000;

/// Parses an ICS document, expanding recurring series over `window`.
///
/// Floating times, and times whose `TZID` is not an IANA name, are read in
/// `local`. Non-recurring events are returned whatever their position
/// relative to `window`; clipping is left to normalization.
pub fn parse_calendar(
    ics: &str,
    window: &TimeWindow,
    local: Tz,
) -> UpstreamResult<Vec<RawEvent>> {
    if !ics.trim_start().starts_with("BEGIN:VCALENDAR") {
        return Err(UpstreamError::malformed("response is not an iCalendar document").with_payload(ics));
    }
    let calendar = ics.parse::<Calendar>().map_err(|e| {
        UpstreamError::malformed(format!("failed to parse iCalendar: {e}")).with_payload(ics)
    })?;

    let vevents: Vec<&Event> = calendar
        .iter()
        .filter_map(|component| match component {
            CalendarComponent::Event(event) => Some(event),
            _ => None,
        })
        .collect();

    // Series instances that an override replaces, keyed by UID.
    let mut overridden: HashMap<&str, HashSet<DateTime<Utc>>> = HashMap::new();
    for event in &vevents {
        let (Some(uid), Some(recurrence_id)) = (event.get_uid(), event.get_recurrence_id()) else {
            continue;
        };
        if let Some(at) = convert_time(recurrence_id, local).and_then(|t| t.resolve(&local)) {
            overridden.entry(uid).or_default().insert(at);
        }
    }

    let mut events = Vec::new();
    for event in vevents {
        let Some(raw) = parse_event(event, local) else {
            continue;
        };
        if event.get_recurrence_id().is_none() && is_recurring(event) {
            let replaced = event.get_uid().and_then(|uid| overridden.get(uid));
            events.extend(expand_series(event, &raw, window, local, replaced));
        } else {
            events.push(raw);
        }
    }

    debug!(count = events.len(), "parsed ICS events");
    Ok(events)
}

fn is_recurring(event: &Event) -> bool {
    event.property_value("RRULE").is_some() || event.multi_properties().contains_key("RDATE")
}

/// Expands the series whose first instance is `first` into the instances
/// overlapping `window`.
fn expand_series(
    event: &Event,
    first: &RawEvent,
    window: &TimeWindow,
    local: Tz,
    replaced: Option<&HashSet<DateTime<Utc>>>,
) -> Vec<RawEvent> {
    let uid = first.uid.as_deref().unwrap_or("<no uid>");
    let (Some(first_start), Some(first_end)) = (first.start.resolve(&local), first.end.resolve(&local))
    else {
        return Vec::new();
    };
    let length = first_end - first_start;
    let all_day = first.start.is_all_day();

    let Some((zone, naive_start)) = event.get_start().map(|start| series_clock(start, local)) else {
        return Vec::new();
    };
    let rrule_zone = rrule::Tz::from(zone);
    let Some(dt_start) = rrule_zone.from_local_datetime(&naive_start).earliest() else {
        return Vec::new();
    };

    let mut set = match event.property_value("RRULE") {
        Some(rule) => match until_in_utc(rule, &zone)
            .parse::<RRule<Unvalidated>>()
            .and_then(|rule| rule.build(dt_start))
        {
            Ok(set) => set,
            Err(e) => {
                warn!(uid, rule, error = %e, "unsupported RRULE, keeping the first instance");
                RRuleSet::new(dt_start).rdate(dt_start)
            }
        },
        None => RRuleSet::new(dt_start).rdate(dt_start),
    };
    for rdate in date_list(event, "RDATE", local) {
        set = set.rdate(rdate.with_timezone(&rrule_zone));
    }
    for exdate in date_list(event, "EXDATE", local) {
        set = set.exdate(exdate.with_timezone(&rrule_zone));
    }

    let result = set
        .after((window.start - length).with_timezone(&rrule_zone))
        .before(window.end.with_timezone(&rrule_zone))
        .all(MAX_INSTANCES);
    if result.limited {
        warn!(uid, limit = MAX_INSTANCES, "series expansion truncated");
    }

    result
        .dates
        .into_iter()
        .filter_map(|instance| {
            let start = instance.with_timezone(&Utc);
            if replaced.is_some_and(|replaced| replaced.contains(&start)) {
                debug!(uid, %start, "instance replaced by an override");
                return None;
            }
            let mut raw = first.clone();
            if all_day {
                let date = instance.date_naive();
                let days = u64::try_from(length.num_days()).ok()?;
                raw.start = RawEventTime::Date(date);
                raw.end = RawEventTime::Date(date.checked_add_days(Days::new(days))?);
            } else {
                raw.start = RawEventTime::DateTime(start);
                raw.end = RawEventTime::DateTime(start + length);
            }
            Some(raw)
        })
        .collect()
}

/// Zone and local wall time a series repeats in.
fn series_clock(start: DatePerhapsTime, local: Tz) -> (Tz, NaiveDateTime) {
    match start {
        DatePerhapsTime::Date(date) => (local, date.and_time(NaiveTime::MIN)),
        DatePerhapsTime::DateTime(CalendarDateTime::Utc(dt)) => (chrono_tz::UTC, dt.naive_utc()),
        DatePerhapsTime::DateTime(CalendarDateTime::Floating(naive)) => (local, naive),
        DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, tzid }) => {
            (tzid.trim_matches('"').parse::<Tz>().unwrap_or(local), date_time)
        }
    }
}

/// Rewrites a floating or date-only `UNTIL` to UTC, read in `zone`.
///
/// A date-only bound covers the whole of that day.
fn until_in_utc(rule: &str, zone: &Tz) -> String {
    rule.split(';')
        .map(|part| {
            let Some(value) = part.strip_prefix("UNTIL=") else {
                return part.to_string();
            };
            if value.ends_with('Z') {
                return part.to_string();
            }
            let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok().or_else(|| {
                NaiveDate::parse_from_str(value, "%Y%m%d")
                    .ok()
                    .and_then(|date| date.and_hms_opt(23, 59, 59))
            });
            match naive.and_then(|naive| zone.from_local_datetime(&naive).earliest()) {
                Some(until) => format!("UNTIL={}", until.with_timezone(&Utc).format("%Y%m%dT%H%M%SZ")),
                None => part.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Instants listed by every `key` property of `event`, split on commas.
///
/// `PERIOD` values are ignored.
fn date_list(event: &Event, key: &str, local: Tz) -> Vec<DateTime<Utc>> {
    let Some(properties) = event.multi_properties().get(key) else {
        return Vec::new();
    };
    properties
        .iter()
        .flat_map(|property| {
            property
                .value()
                .split(',')
                .filter(|value| !value.contains('/'))
                .map(move |value| {
                    let mut single = Property::new(key, value.trim());
                    for (name, parameter) in property.params() {
                        single.add_parameter(name, parameter.value());
                    }
                    single.done()
                })
        })
        .filter_map(|property| DatePerhapsTime::from_property(&property))
        .filter_map(|value| convert_time(value, local))
        .filter_map(|time| time.resolve(&local))
        .collect()
}

fn parse_event(event: &Event, local: Tz) -> Option<RawEvent> {
    let uid = event.get_uid().unwrap_or("<no uid>");

    if matches!(event.get_status(), Some(EventStatus::Cancelled)) {
        debug!(uid, "skipping cancelled event");
        return None;
    }

    let busy_status = match event.property_value(CDO_BUSY_STATUS) {
        Some(value) => BusyStatus::parse(value),
        None if event
            .property_value("TRANSP")
            .is_some_and(|t| t.eq_ignore_ascii_case("TRANSPARENT")) =>
        {
            BusyStatus::Free
        }
        None => BusyStatus::Busy,
    };
    if busy_status == BusyStatus::Free {
        debug!(uid, "skipping free event");
        return None;
    }

    let Some(start) = event.get_start() else {
        warn!(uid, "event without DTSTART, skipping");
        return None;
    };
    let Some(start) = convert_time(start, local) else {
        warn!(uid, "event start does not exist in its timezone, skipping");
        return None;
    };
    let end = match event.get_end() {
        Some(end) => convert_time(end, local),
        // RFC 5545: a date-only event without DTEND lasts one day.
        None => match start {
            RawEventTime::Date(date) => date.checked_add_days(Days::new(1)).map(RawEventTime::Date),
            time => Some(time),
        },
    };
    let Some(end) = end else {
        warn!(uid, "event end could not be resolved, skipping");
        return None;
    };

    let mut raw = RawEvent::new(start, end).with_busy_status(busy_status);
    if let Some(uid) = event.get_uid() {
        raw = raw.with_uid(uid);
    }
    if let Some(summary) = event.get_summary().filter(|s| !s.trim().is_empty()) {
        raw = raw.with_subject(summary);
    }
    if let Some(organizer) = event.property_value("ORGANIZER") {
        let organizer = organizer
            .strip_prefix("mailto:")
            .or_else(|| organizer.strip_prefix("MAILTO:"))
            .unwrap_or(organizer);
        raw = raw.with_organizer(organizer);
    }
    Some(raw)
}

fn convert_time(value: DatePerhapsTime, local: Tz) -> Option<RawEventTime> {
    match value {
        DatePerhapsTime::Date(date) => Some(RawEventTime::Date(date)),
        DatePerhapsTime::DateTime(CalendarDateTime::Utc(dt)) => Some(RawEventTime::DateTime(dt)),
        DatePerhapsTime::DateTime(CalendarDateTime::Floating(naive)) => {
            localize(&local, &naive).map(RawEventTime::DateTime)
        }
        DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, tzid }) => {
            let tz = match tzid.trim_matches('"').parse::<Tz>() {
                Ok(tz) => tz,
                Err(_) => {
                    debug!(tzid, fallback = %local, "unknown TZID, using local zone");
                    local
                }
            };
            localize(&tz, &date_time).map(RawEventTime::DateTime)
        }
    }
}

fn localize(tz: &Tz, naive: &NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}
