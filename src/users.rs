//! Identity-side operations: user lookup, the singleton bot user, XP
//! grants, the words-played counter.

use diesel::{SqliteConnection, prelude::*};

use crate::{auth::User, schema::users, settings::Settings};

pub const BOT_USERNAME: &str = "wordbot";

pub fn get_user(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> QueryResult<Option<User>> {
    users::table
        .filter(users::id.eq(user_id))
        .first::<User>(conn)
        .optional()
}

/// Fetches the singleton bot user record, creating it on first use. The
/// matchmaking pool clones this in memory and gives the clone a per-game
/// display name and level; the row itself never changes.
pub fn get_or_create_bot_user(conn: &mut SqliteConnection) -> QueryResult<User> {
    if let Some(bot) = users::table
        .filter(users::is_bot.eq(true))
        .order_by(users::id.asc())
        .first::<User>(conn)
        .optional()?
    {
        return Ok(bot);
    }

    diesel::insert_into(users::table)
        .values((users::username.eq(BOT_USERNAME), users::is_bot.eq(true)))
        .execute(conn)?;

    users::table
        .filter(users::is_bot.eq(true))
        .order_by(users::id.asc())
        .first::<User>(conn)
}

fn xp_needed_for_next_level(settings: &Settings, level: i64) -> f64 {
    level as f64
        * settings.xp_per_level_base as f64
        * settings
            .xp_per_level_multiplier
            .powi((level - 1).max(0) as i32)
}

/// Adds experience and applies level-ups. Bots accrue nothing.
pub fn add_experience(
    conn: &mut SqliteConnection,
    settings: &Settings,
    user_id: i64,
    amount: i64,
) -> QueryResult<()> {
    let Some(user) = get_user(conn, user_id)? else {
        return Ok(());
    };
    if user.is_bot {
        return Ok(());
    }

    let experience = user.experience + amount;
    let mut level = user.level.max(1);
    while experience as f64 >= xp_needed_for_next_level(settings, level) {
        level += 1;
        tracing::info!(user_id, level, "user leveled up");
    }

    diesel::update(users::table.filter(users::id.eq(user_id)))
        .set((users::experience.eq(experience), users::level.eq(level)))
        .execute(conn)?;
    Ok(())
}

pub fn increment_words_count(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> QueryResult<()> {
    diesel::update(users::table.filter(users::id.eq(user_id)))
        .set(users::words_count.eq(users::words_count + 1))
        .execute(conn)?;
    Ok(())
}
