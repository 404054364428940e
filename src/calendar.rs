//! Google Calendar "add event" links. No OAuth: the link opens a prefilled
//! event form in the browser.

use chrono::{Duration, NaiveDateTime};
use url::Url;

use crate::models::InterviewView;

const CALENDAR_RENDER_URL: &str = "https://calendar.google.com/calendar/render";
const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Times are local with no zone. `end` defaults to one hour after `start`.
/// Empty details or location are left out of the query.
pub fn google_calendar_url(
    title: &str,
    start: NaiveDateTime,
    end: Option<NaiveDateTime>,
    details: &str,
    location: &str,
) -> String {
    let end = end.unwrap_or(start + Duration::hours(1));
    let dates = format!("{}/{}", start.format(STAMP_FORMAT), end.format(STAMP_FORMAT));

    let params = [
        ("action", "TEMPLATE"),
        ("text", title),
        ("dates", dates.as_str()),
        ("details", details),
        ("location", location),
    ];
    let params = params.into_iter().filter(|(_, value)| !value.is_empty());

    match Url::parse_with_params(CALENDAR_RENDER_URL, params) {
        Ok(url) => url.into(),
        Err(_) => CALENDAR_RENDER_URL.to_string(),
    }
}

/// Link for an interview; none when the time of day is unknown.
pub fn interview_link(interview: &InterviewView) -> Option<String> {
    let time = interview.time?;
    let title = format!("Interview: {} - {}", interview.company, interview.role);
    let details = format!(
        "Job Application Interview\n\nCompany: {}\nRole: {}",
        interview.company, interview.role
    );
    Some(google_calendar_url(
        &title,
        interview.date.and_time(time),
        None,
        &details,
        &interview.venue,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InterviewSource;
    use chrono::{NaiveDate, NaiveTime};

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M").unwrap()
    }

    fn query(link: &str) -> Vec<(String, String)> {
        Url::parse(link)
            .unwrap()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn test_default_duration_is_one_hour() {
        let link = google_calendar_url("Interview: Acme - Engineer", at("2024-01-10", "14:00"), None, "", "Zoom");
        let pairs = query(&link);
        assert!(link.starts_with(CALENDAR_RENDER_URL));
        assert!(pairs.contains(&("dates".to_string(), "20240110T140000/20240110T150000".to_string())));
        assert!(pairs.contains(&("text".to_string(), "Interview: Acme - Engineer".to_string())));
        assert!(pairs.contains(&("action".to_string(), "TEMPLATE".to_string())));
    }

    #[test]
    fn test_empty_fields_are_omitted() {
        let link = google_calendar_url(
            "Call",
            at("2024-01-10", "23:30"),
            Some(at("2024-01-11", "00:15")),
            "",
            "",
        );
        let keys: Vec<String> = query(&link).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["action", "text", "dates"]);
        assert!(link.contains("20240110T233000%2F20240111T001500"));
    }

    #[test]
    fn test_interview_link_needs_a_time() {
        let mut view = InterviewView {
            application_id: 1,
            company: "Acme".to_string(),
            role: "Engineer".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            time: None,
            venue: "Office & Lobby".to_string(),
            completed: false,
            difficulty: None,
            notes: None,
            source: InterviewSource::Legacy,
        };
        assert!(interview_link(&view).is_none());

        view.time = NaiveTime::from_hms_opt(9, 0, 0);
        let pairs = query(&interview_link(&view).unwrap());
        assert!(pairs.contains(&("location".to_string(), "Office & Lobby".to_string())));
        assert!(pairs.contains(&("dates".to_string(), "20240110T090000/20240110T100000".to_string())));
    }
}
