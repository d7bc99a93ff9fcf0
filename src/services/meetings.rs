use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::entities::meeting::{self, Attendee, Attendees, MeetingStatus};
use crate::errors::ServiceError;

fn validate_future_start(starts_at: &DateTime<Utc>) -> Result<(), ValidationError> {
    if *starts_at <= Utc::now() {
        return Err(ValidationError::new("starts_at_in_past"));
    }
    Ok(())
}

/// Body of `POST /quotes/:id/meetings`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct ScheduleMeetingRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[validate(custom = "validate_future_start")]
    pub starts_at: DateTime<Utc>,
    #[validate(range(min = 1, max = 480))]
    pub duration_minutes: i32,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    #[validate(url)]
    pub meeting_url: Option<String>,
    /// Attendees besides the quote's client
    #[serde(default)]
    pub attendees: Vec<Attendee>,
}

/// Stores a scheduled meeting for `quote_id` with `client` first in the attendee list.
pub async fn insert_meeting<C: ConnectionTrait>(
    conn: &C,
    quote_id: Uuid,
    organizer_id: Uuid,
    default_title: String,
    client: Attendee,
    request: ScheduleMeetingRequest,
) -> Result<meeting::Model, ServiceError> {
    let mut attendees = vec![client];
    for extra in request.attendees {
        if !attendees.iter().any(|a| a.email.eq_ignore_ascii_case(&extra.email)) {
            attendees.push(extra);
        }
    }

    let model = meeting::ActiveModel {
        id: Set(Uuid::new_v4()),
        quote_id: Set(quote_id),
        organizer_id: Set(organizer_id),
        title: Set(request.title.unwrap_or(default_title)),
        description: Set(request.description),
        starts_at: Set(request.starts_at),
        duration_minutes: Set(request.duration_minutes),
        location: Set(request.location),
        meeting_url: Set(request.meeting_url),
        attendees: Set(Attendees(attendees)),
        status: Set(MeetingStatus::Scheduled),
        created_at: Set(Utc::now()),
    };
    Ok(model.insert(conn).await?)
}

pub async fn meetings_for_quote<C: ConnectionTrait>(
    conn: &C,
    quote_id: Uuid,
) -> Result<Vec<meeting::Model>, ServiceError> {
    Ok(meeting::Entity::find()
        .filter(meeting::Column::QuoteId.eq(quote_id))
        .order_by_asc(meeting::Column::StartsAt)
        .all(conn)
        .await?)
}

fn ics_time(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

fn ics_escape(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace(';', "\\;")
        .replace(',', "\\,")
        .replace("\r\n", "\\n")
        .replace('\n', "\\n")
}

/// Folds a content line at 75 octets, continuation lines starting with a space.
fn fold(line: &str, out: &mut String) {
    let mut width = 0;
    for c in line.chars() {
        let len = c.len_utf8();
        if width + len > 75 {
            out.push_str("\r\n ");
            width = 1;
        }
        out.push(c);
        width += len;
    }
    out.push_str("\r\n");
}

/// iCalendar `REQUEST` for a meeting, organized from `organizer_email`.
pub fn calendar_invite(meeting: &meeting::Model, organizer_email: &str) -> String {
    let mut lines = vec![
        "BEGIN:VCALENDAR".to_string(),
        "VERSION:2.0".to_string(),
        "PRODID:-//VAIF TECH//Quotes//EN".to_string(),
        "METHOD:REQUEST".to_string(),
        "BEGIN:VEVENT".to_string(),
        format!("UID:{}@vaif.tech", meeting.id),
        format!("DTSTAMP:{}", ics_time(meeting.created_at)),
        format!("DTSTART:{}", ics_time(meeting.starts_at)),
        format!("DTEND:{}", ics_time(meeting.ends_at())),
        format!("SUMMARY:{}", ics_escape(&meeting.title)),
    ];
    if let Some(description) = &meeting.description {
        lines.push(format!("DESCRIPTION:{}", ics_escape(description)));
    }
    if let Some(location) = &meeting.location {
        lines.push(format!("LOCATION:{}", ics_escape(location)));
    }
    if let Some(url) = &meeting.meeting_url {
        lines.push(format!("URL:{}", url));
    }
    lines.push(format!("ORGANIZER;CN=VAIF TECH:mailto:{}", organizer_email));
    for attendee in &meeting.attendees.0 {
        lines.push(format!(
            "ATTENDEE;CN=\"{}\";ROLE=REQ-PARTICIPANT;RSVP=TRUE:mailto:{}",
            attendee.name.replace('"', "'"),
            attendee.email
        ));
    }
    lines.extend(
        ["STATUS:CONFIRMED", "SEQUENCE:0", "END:VEVENT", "END:VCALENDAR"]
            .iter()
            .map(|s| s.to_string()),
    );

    let mut out = String::new();
    for line in &lines {
        fold(line, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn meeting() -> meeting::Model {
        meeting::Model {
            id: Uuid::nil(),
            quote_id: Uuid::new_v4(),
            organizer_id: Uuid::new_v4(),
            title: "Kickoff, scope; budget".into(),
            description: Some("Line one\nLine two".into()),
            starts_at: Utc.with_ymd_and_hms(2024, 7, 1, 15, 0, 0).unwrap(),
            duration_minutes: 45,
            location: None,
            meeting_url: Some("https://meet.example.com/abc".into()),
            attendees: Attendees(vec![Attendee {
                name: "Dana Client".into(),
                email: "dana@example.com".into(),
            }]),
            status: MeetingStatus::Scheduled,
            created_at: Utc.with_ymd_and_hms(2024, 6, 20, 9, 0, 0).unwrap(),
        }
    }

    #[test]
    fn invite_carries_times_attendees_and_escapes() {
        let folded = calendar_invite(&meeting(), "quotes@vaif.tech");
        // content lines may be folded anywhere; compare them unfolded
        let ics = folded.replace("\r\n ", "");
        assert!(ics.starts_with("BEGIN:VCALENDAR\r\n"));
        assert!(ics.contains("DTSTART:20240701T150000Z\r\n"));
        assert!(ics.contains("DTEND:20240701T154500Z\r\n"));
        assert!(ics.contains("SUMMARY:Kickoff\\, scope\\; budget\r\n"));
        assert!(ics.contains("DESCRIPTION:Line one\\nLine two\r\n"));
        assert!(ics.contains("mailto:dana@example.com"));
        assert!(ics.ends_with("END:VCALENDAR\r\n"));
    }

    #[test]
    fn long_lines_are_folded() {
        let mut m = meeting();
        m.description = Some("x".repeat(200));
        let ics = calendar_invite(&m, "quotes@vaif.tech");
        assert!(ics.split("\r\n").all(|line| line.len() <= 75));
    }

    #[test]
    fn request_validation_rejects_past_start_and_bad_duration() {
        let request = ScheduleMeetingRequest {
            title: None,
            description: None,
            starts_at: Utc::now() - Duration::hours(1),
            duration_minutes: 0,
            location: None,
            meeting_url: None,
            attendees: vec![],
        };
        let errors = request.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("starts_at"));
        assert!(fields.contains_key("duration_minutes"));
    }
}
