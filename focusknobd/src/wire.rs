//! Lines the knob sends to the host, classified by prefix.

use crate::device::channel::{ACK, PONG};

pub const TIME_OK: &str = "TIME_OK";
pub const GET_LOGS: &str = "GET_LOGS";
pub const JIRA_LOG_OK: &str = "JIRA_LOG_OK";
pub const JIRA_LOG_ERROR: &str = "JIRA_LOG_ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceLine<'a> {
    /// `LOG:<json>` daily focus summary.
    Log(&'a str),
    /// `NOTE:<json>` note captured on the device.
    Note(&'a str),
    /// `JIRA_TIMER_DONE:<KEY>|<MIN>`
    JiraTimerDone(&'a str),
    /// `JIRA_LOG_TIME:<KEY>`
    JiraLogTime(&'a str),
    /// `JIRA_LOG_MEETING:<TITLE>|<MIN>`
    JiraLogMeeting(&'a str),
    /// `JIRA_OPEN:<KEY>`
    JiraOpen(&'a str),
    /// `<COMMAND>_OK` for a data push; carries `<COMMAND>`.
    Ack(&'a str),
    Error(&'a str),
    Ready(&'a str),
    /// `PONG`, `TIME_OK`, `OK`.
    Expected,
    Debug(&'a str),
    Unknown(&'a str),
}

impl<'a> DeviceLine<'a> {
    pub fn parse(line: &'a str) -> Self {
        if line == PONG || line == TIME_OK || line == ACK {
            return DeviceLine::Expected;
        }
        let prefixes: [(&str, fn(&'a str) -> DeviceLine<'a>); 8] = [
            ("LOG:", DeviceLine::Log),
            ("NOTE:", DeviceLine::Note),
            ("JIRA_TIMER_DONE:", DeviceLine::JiraTimerDone),
            ("JIRA_LOG_TIME:", DeviceLine::JiraLogTime),
            ("JIRA_LOG_MEETING:", DeviceLine::JiraLogMeeting),
            ("JIRA_OPEN:", DeviceLine::JiraOpen),
            ("ERROR:", DeviceLine::Error),
            ("READY:", DeviceLine::Ready),
        ];
        for (prefix, build) in prefixes {
            if let Some(rest) = line.strip_prefix(prefix) {
                return build(rest);
            }
        }
        if line.starts_with("USBSync:") || line.starts_with("TimeLog:") {
            return DeviceLine::Debug(line);
        }
        match line.strip_suffix("_OK") {
            Some(command) if !command.is_empty() && !command.contains(':') => {
                DeviceLine::Ack(command)
            }
            _ => DeviceLine::Unknown(line),
        }
    }
}

/// Strip NULs and surrounding whitespace from a workflow payload.
pub fn clean_payload(payload: &str) -> String {
    payload.replace('\0', "").trim().to_string()
}

pub fn log_error(reason: &str) -> String {
    format!("{JIRA_LOG_ERROR}:{reason}")
}

/// `TIME:<local time>` clock sync command.
pub fn time_command(now: chrono::NaiveDateTime) -> String {
    format!("TIME:{}", now.format("%Y-%m-%dT%H:%M:%S"))
}
