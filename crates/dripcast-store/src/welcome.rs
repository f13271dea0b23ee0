//! Welcome menu: ordered labels, each owning ordered follow-up messages.

use dripcast_core::error::{DripError, Result};
use rusqlite::{OptionalExtension, params};

use crate::models::{Followup, MenuButton};
use crate::pool::db_err;
use crate::templates::blank_to_none;
use crate::{Db, not_found};

fn clean_label(label: &str) -> Result<&str> {
    let label = label.trim();
    if label.is_empty() {
        return Err(DripError::validation("label", "must not be empty"));
    }
    Ok(label)
}

impl Db<'_> {
    pub fn list_menu(&self) -> Result<Vec<MenuButton>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, label, position FROM welcome_buttons ORDER BY position, id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                ))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter()
            .map(|(id, label, position)| {
                Ok(MenuButton {
                    id,
                    label,
                    position,
                    followups: self.followups(id)?,
                })
            })
            .collect()
    }

    /// Labels in menu order, for the reply keyboard.
    pub fn menu_labels(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT label FROM welcome_buttons ORDER BY position, id")
            .map_err(db_err)?;
        let labels = stmt
            .query_map([], |r| r.get(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(db_err)?;
        Ok(labels)
    }

    pub fn add_menu_button(&self, label: &str) -> Result<MenuButton> {
        let label = clean_label(label)?;
        self.ensure_label_free(label, None)?;
        self.conn
            .execute(
                "INSERT INTO welcome_buttons (label, position)
                 VALUES (?1, (SELECT COALESCE(MAX(position), 0) + 1 FROM welcome_buttons))",
                params![label],
            )
            .map_err(db_err)?;
        self.menu_button(self.conn.last_insert_rowid())
    }

    pub fn rename_menu_button(&self, id: i64, label: &str) -> Result<MenuButton> {
        let label = clean_label(label)?;
        self.ensure_label_free(label, Some(id))?;
        let changed = self
            .conn
            .execute(
                "UPDATE welcome_buttons SET label = ?2 WHERE id = ?1",
                params![id, label],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(not_found(format!("menu button {id}")));
        }
        self.menu_button(id)
    }

    /// Removes the label and, by cascade, its follow-ups.
    pub fn delete_menu_button(&self, id: i64) -> Result<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM welcome_buttons WHERE id = ?1", params![id])
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(not_found(format!("menu button {id}")));
        }
        Ok(())
    }

    pub fn add_followup(
        &self,
        button_id: i64,
        body: &str,
        photo_ref: Option<String>,
    ) -> Result<Followup> {
        if body.trim().is_empty() {
            return Err(DripError::validation("body", "must not be empty"));
        }
        self.menu_button(button_id)?;
        self.conn
            .execute(
                "INSERT INTO welcome_followups (button_id, position, body, photo_ref)
                 VALUES (?1,
                         (SELECT COALESCE(MAX(position), 0) + 1 FROM welcome_followups
                          WHERE button_id = ?1),
                         ?2, ?3)",
                params![button_id, body, blank_to_none(&photo_ref)],
            )
            .map_err(db_err)?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, position, body, photo_ref FROM welcome_followups WHERE id = ?1",
                params![id],
                |r| {
                    Ok(Followup {
                        id: r.get(0)?,
                        position: r.get(1)?,
                        body: r.get(2)?,
                        photo_ref: r.get(3)?,
                    })
                },
            )
            .map_err(db_err)
    }

    pub fn delete_followup(&self, id: i64) -> Result<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM welcome_followups WHERE id = ?1", params![id])
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(not_found(format!("follow-up {id}")));
        }
        Ok(())
    }

    /// Follow-ups for a pressed label; `None` if the text is not a menu label.
    pub fn followups_for_label(&self, label: &str) -> Result<Option<Vec<Followup>>> {
        let id: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM welcome_buttons WHERE label = ?1",
                params![label.trim()],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        id.map(|id| self.followups(id)).transpose()
    }

    fn menu_button(&self, id: i64) -> Result<MenuButton> {
        let row = self
            .conn
            .query_row(
                "SELECT label, position FROM welcome_buttons WHERE id = ?1",
                params![id],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        let (label, position) = row.ok_or_else(|| not_found(format!("menu button {id}")))?;
        Ok(MenuButton {
            id,
            label,
            position,
            followups: self.followups(id)?,
        })
    }

    fn followups(&self, button_id: i64) -> Result<Vec<Followup>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, position, body, photo_ref FROM welcome_followups
                 WHERE button_id = ?1 ORDER BY position, id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![button_id], |r| {
                Ok(Followup {
                    id: r.get(0)?,
                    position: r.get(1)?,
                    body: r.get(2)?,
                    photo_ref: r.get(3)?,
                })
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    fn ensure_label_free(&self, label: &str, except: Option<i64>) -> Result<()> {
        let taken: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM welcome_buttons WHERE label = ?1 AND id != ?2)",
                params![label, except.unwrap_or(-1)],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        if taken {
            return Err(DripError::validation(
                "label",
                format!("'{label}' is already on the menu"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::store;

    #[test]
    fn test_menu_crud() {
        let (_dir, store) = store();
        let (prices, about) = store
            .write(|db| {
                let prices = db.add_menu_button("Prices")?;
                let about = db.add_menu_button("About")?;
                db.add_followup(prices.id, "Plans start at 9.99", None)?;
                db.add_followup(prices.id, "Here is the table", Some("photo-1".into()))?;
                Ok((prices, about))
            })
            .unwrap();
        assert_eq!(store.read(|db| db.menu_labels()).unwrap(), vec!["Prices", "About"]);

        let followups = store
            .read(|db| db.followups_for_label("Prices"))
            .unwrap()
            .unwrap();
        assert_eq!(followups.len(), 2);
        assert_eq!(followups[0].body, "Plans start at 9.99");
        assert_eq!(followups[1].photo_ref.as_deref(), Some("photo-1"));
        assert!(store.read(|db| db.followups_for_label("hello")).unwrap().is_none());

        let err = store.write(|db| db.rename_menu_button(about.id, "Prices")).unwrap_err();
        assert_eq!(err.kind(), "validation");
        store.write(|db| db.rename_menu_button(about.id, "Who we are")).unwrap();

        store.write(|db| db.delete_menu_button(prices.id)).unwrap();
        let menu = store.read(|db| db.list_menu()).unwrap();
        assert_eq!(menu.len(), 1);
        assert_eq!(menu[0].label, "Who we are");
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let (_dir, store) = store();
        store.write(|db| db.add_menu_button("Prices")).unwrap();
        let err = store.write(|db| db.add_menu_button(" Prices ")).unwrap_err();
        assert_eq!(err.kind(), "validation");
        let err = store.write(|db| db.add_followup(99, "x", None)).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
