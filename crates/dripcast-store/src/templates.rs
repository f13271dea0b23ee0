//! Drip templates for both tracks, with their link buttons.
//!
//! `seq_no` stays dense (1..N) per track: appends take N+1 and a delete
//! shifts everything above it down by one, carrying un-sent deliveries along.

use chrono::{DateTime, Utc};
use dripcast_core::error::{DripError, Result};
use dripcast_core::types::{LinkButton, Track};
use rusqlite::{OptionalExtension, params};

use crate::models::{Template, TemplateInput};
use crate::pool::db_err;
use crate::{Db, not_found, time};

/// Reject empty bodies, bad delays, and buttons that are not absolute links.
pub fn validate_template(input: &TemplateInput) -> Result<()> {
    if input.body.trim().is_empty() {
        return Err(DripError::validation("body", "must not be empty"));
    }
    time::check_delay_hours(input.delay_hours)?;
    validate_buttons(&input.buttons)
}

pub fn validate_buttons(buttons: &[LinkButton]) -> Result<()> {
    for (i, button) in buttons.iter().enumerate() {
        if button.label.trim().is_empty() {
            return Err(DripError::validation(
                format!("buttons[{i}].label"),
                "must not be empty",
            ));
        }
        let url = button.url.trim();
        if !(url.starts_with("https://") || url.starts_with("http://") || url.starts_with("tg://"))
        {
            return Err(DripError::validation(
                format!("buttons[{i}].url"),
                format!("'{url}' is not an http(s) or tg:// link"),
            ));
        }
    }
    Ok(())
}

impl Db<'_> {
    pub fn list_templates(&self, track: Track) -> Result<Vec<Template>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, seq_no, body, photo_ref, delay_hours FROM templates
                 WHERE track = ?1 ORDER BY seq_no",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![track.as_str()], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, f64>(4)?,
                ))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(id, seq_no, body, photo_ref, delay_hours)| {
                Ok(Template {
                    id,
                    track,
                    seq_no,
                    body,
                    photo_ref,
                    delay_hours,
                    buttons: self.template_buttons(id)?,
                })
            })
            .collect()
    }

    pub fn get_template(&self, track: Track, seq_no: i64) -> Result<Template> {
        let row = self
            .conn
            .query_row(
                "SELECT id, body, photo_ref, delay_hours FROM templates
                 WHERE track = ?1 AND seq_no = ?2",
                params![track.as_str(), seq_no],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, Option<String>>(2)?,
                        r.get::<_, f64>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;
        let (id, body, photo_ref, delay_hours) =
            row.ok_or_else(|| not_found(format!("{track} template #{seq_no}")))?;
        Ok(Template {
            id,
            track,
            seq_no,
            body,
            photo_ref,
            delay_hours,
            buttons: self.template_buttons(id)?,
        })
    }

    /// Append a template as `seq_no = N + 1`.
    pub fn add_template(&self, track: Track, input: &TemplateInput) -> Result<Template> {
        validate_template(input)?;
        let next: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(seq_no), 0) + 1 FROM templates WHERE track = ?1",
                params![track.as_str()],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        self.conn
            .execute(
                "INSERT INTO templates (track, seq_no, body, photo_ref, delay_hours)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    track.as_str(),
                    next,
                    input.body,
                    blank_to_none(&input.photo_ref),
                    input.delay_hours
                ],
            )
            .map_err(db_err)?;
        let id = self.conn.last_insert_rowid();
        self.replace_template_buttons(id, &input.buttons)?;
        self.get_template(track, next)
    }

    /// Replace body, photo, delay and buttons. Already planned deliveries
    /// keep their `fire_at`; only their content changes.
    pub fn update_template(
        &self,
        track: Track,
        seq_no: i64,
        input: &TemplateInput,
    ) -> Result<Template> {
        validate_template(input)?;
        let existing = self.get_template(track, seq_no)?;
        self.conn
            .execute(
                "UPDATE templates SET body = ?2, photo_ref = ?3, delay_hours = ?4 WHERE id = ?1",
                params![
                    existing.id,
                    input.body,
                    blank_to_none(&input.photo_ref),
                    input.delay_hours
                ],
            )
            .map_err(db_err)?;
        self.replace_template_buttons(existing.id, &input.buttons)?;
        self.get_template(track, seq_no)
    }

    /// Delete template `seq_no`, its buttons, and every un-sent delivery
    /// referencing it, then close the gap. Returns the number of cancelled
    /// deliveries.
    pub fn delete_template(&self, track: Track, seq_no: i64) -> Result<usize> {
        let existing = self.get_template(track, seq_no)?;
        self.conn
            .execute("DELETE FROM templates WHERE id = ?1", params![existing.id])
            .map_err(db_err)?;
        let cancelled = self
            .conn
            .execute(
                "DELETE FROM scheduled_deliveries WHERE track = ?1 AND seq_no = ?2 AND sent = 0",
                params![track.as_str(), seq_no],
            )
            .map_err(db_err)?;

        // Two passes through negative numbers so UNIQUE indexes never see a
        // transient collision. Sent history keeps its numbers.
        for (table, filter) in [("templates", ""), ("scheduled_deliveries", " AND sent = 0")] {
            self.conn
                .execute(
                    &format!(
                        "UPDATE {table} SET seq_no = -(seq_no - 1)
                         WHERE track = ?1 AND seq_no > ?2{filter}"
                    ),
                    params![track.as_str(), seq_no],
                )
                .map_err(db_err)?;
            self.conn
                .execute(
                    &format!("UPDATE {table} SET seq_no = -seq_no WHERE track = ?1 AND seq_no < 0{filter}"),
                    params![track.as_str()],
                )
                .map_err(db_err)?;
        }
        tracing::debug!(track = %track, seq_no, cancelled, "template deleted");
        Ok(cancelled)
    }

    pub(crate) fn template_buttons(&self, template_id: i64) -> Result<Vec<LinkButton>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT label, url FROM template_buttons WHERE template_id = ?1
                 ORDER BY position, id",
            )
            .map_err(db_err)?;
        let buttons = stmt
            .query_map(params![template_id], |r| {
                Ok(LinkButton {
                    label: r.get(0)?,
                    url: r.get(1)?,
                })
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(buttons)
    }

    fn replace_template_buttons(&self, template_id: i64, buttons: &[LinkButton]) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM template_buttons WHERE template_id = ?1",
                params![template_id],
            )
            .map_err(db_err)?;
        for (position, button) in buttons.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT INTO template_buttons (template_id, label, url, position)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![template_id, button.label.trim(), button.url.trim(), position as i64],
                )
                .map_err(db_err)?;
        }
        Ok(())
    }

    /// `fire_at` for each template of `track`, anchored at `anchor`.
    pub fn template_offsets(
        &self,
        track: Track,
        anchor: DateTime<Utc>,
    ) -> Result<Vec<(i64, DateTime<Utc>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq_no, delay_hours FROM templates WHERE track = ?1 ORDER BY seq_no")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![track.as_str()], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter()
            .map(|(seq_no, hours)| Ok((seq_no, time::offset_by_hours(anchor, hours)?)))
            .collect()
    }
}

pub(crate) fn blank_to_none(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
