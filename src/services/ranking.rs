//! Final standings computed from the roster once a match ends.

use serde_json::json;

use crate::dao::models::{MatchPlayer, MatchResult, PlayerRanking};

const ANSWER_EVENT: &str = "answer";

/// Rank `players` by score, highest first.
///
/// The sort is stable: tied players keep their roster (join) order. Accuracy is the share of
/// `answer` events flagged `correct`, expressed as a percentage.
pub fn calculate_rankings(players: &[MatchPlayer]) -> MatchResult {
    let mut rankings: Vec<PlayerRanking> = players.iter().map(player_ranking).collect();
    rankings.sort_by(|a, b| b.score.cmp(&a.score));
    for (index, ranking) in rankings.iter_mut().enumerate() {
        ranking.rank = index as u32 + 1;
    }

    let total_answers: u32 = rankings.iter().map(|r| r.total_answers).sum();
    let correct_answers: u32 = rankings.iter().map(|r| r.correct_answers).sum();
    let stats = json!({
        "total_players": rankings.len(),
        "total_answers": total_answers,
        "correct_answers": correct_answers,
        "top_score": rankings.first().map(|r| r.score),
    });

    MatchResult {
        winner: rankings.first().map(|r| r.user_id.clone()),
        rankings,
        stats,
    }
}

fn player_ranking(player: &MatchPlayer) -> PlayerRanking {
    let answers = player
        .events
        .iter()
        .filter(|event| event.kind == ANSWER_EVENT);
    let (total_answers, correct_answers) = answers.fold((0u32, 0u32), |(total, correct), event| {
        (total + 1, correct + u32::from(event.is_correct()))
    });
    let accuracy = if total_answers == 0 {
        0.0
    } else {
        f64::from(correct_answers) / f64::from(total_answers) * 100.0
    };

    PlayerRanking {
        user_id: player.user_id.clone(),
        name: player.name.clone(),
        score: player.score,
        rank: 0,
        correct_answers,
        total_answers,
        accuracy,
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use serde_json::json;

    use crate::dao::models::PlayerEvent;

    use super::*;

    fn player(user_id: &str, score: i64) -> MatchPlayer {
        let mut player = MatchPlayer::new(user_id.into(), user_id.to_uppercase(), String::new());
        player.score = score;
        player
    }

    fn event(kind: &str, correct: bool) -> PlayerEvent {
        PlayerEvent {
            kind: kind.into(),
            data: json!({ "correct": correct }),
            timestamp: SystemTime::now(),
        }
    }

    #[test]
    fn highest_score_wins() {
        let result = calculate_rankings(&[player("a", 30), player("b", 50)]);

        assert_eq!(result.winner.as_deref(), Some("b"));
        let order: Vec<_> = result
            .rankings
            .iter()
            .map(|r| (r.user_id.as_str(), r.rank, r.score))
            .collect();
        assert_eq!(order, vec![("b", 1, 50), ("a", 2, 30)]);
    }

    #[test]
    fn ties_keep_roster_order() {
        let result = calculate_rankings(&[
            player("first", 10),
            player("second", 20),
            player("third", 10),
            player("fourth", 20),
        ]);
        let order: Vec<_> = result.rankings.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(order, vec!["second", "fourth", "first", "third"]);
        let ranks: Vec<_> = result.rankings.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
    }

    #[test]
    fn accuracy_counts_answer_events_only() {
        let mut p = player("a", 0);
        p.events = vec![
            event("answer", true),
            event("answer", false),
            event("answer", true),
            event("answer", true),
            event("hint", true),
        ];
        let result = calculate_rankings(&[p]);
        let ranking = &result.rankings[0];
        assert_eq!(ranking.total_answers, 4);
        assert_eq!(ranking.correct_answers, 3);
        assert!((ranking.accuracy - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn no_answers_means_zero_accuracy() {
        let result = calculate_rankings(&[player("a", 5)]);
        assert_eq!(result.rankings[0].accuracy, 0.0);
    }

    #[test]
    fn empty_roster_has_no_winner() {
        let result = calculate_rankings(&[]);
        assert!(result.winner.is_none());
        assert!(result.rankings.is_empty());
        assert_eq!(result.stats["total_players"], 0);
    }
}
