use chitragupta::chitragupta::bandit::{BanditMode, StrategyBandit, StrategyContext};

#[test]
fn test_ucb1_majority_preference_after_training() {
    let mut bandit = StrategyBandit::new(&["a", "b", "c"], BanditMode::Ucb1);

    // 20 rewards per arm with means 0.9 / 0.5 / 0.2.
    for _ in 0..20 {
        bandit.record_reward("a", 0.9, None);
        bandit.record_reward("b", 0.5, None);
        bandit.record_reward("c", 0.2, None);
    }

    let mut wins_a = 0;
    for _ in 0..100 {
        let pick = bandit.select_strategy(None);
        if pick == "a" {
            wins_a += 1;
        }
        // Keep feeding the same underlying means.
        let reward = match pick.as_str() {
            "a" => 0.9,
            "b" => 0.5,
            _ => 0.2,
        };
        bandit.record_reward(&pick, reward, None);
    }
    assert!(wins_a > 50, "a selected only {}/100 times", wins_a);

    let stats = bandit.get_stats();
    let a = stats.iter().find(|s| s.name == "a").unwrap();
    assert!((a.average_reward - 0.9).abs() < 0.01);
}

#[test]
fn test_thompson_posterior_updates() {
    let mut bandit = StrategyBandit::new(&["a", "b"], BanditMode::Thompson);
    bandit.record_reward("a", 0.6, None);
    bandit.record_reward("a", 1.0, None);

    let json = bandit.serialize();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    let arms = value["arms"].as_array().unwrap();
    let a = arms.iter().find(|arm| arm["name"] == "a").unwrap();
    // α = 1 + 0.6 + 1.0, β = 1 + 0.4 + 0.0
    assert!((a["alpha"].as_f64().unwrap() - 2.6).abs() < 1e-9);
    assert!((a["beta"].as_f64().unwrap() - 1.4).abs() < 1e-9);
    let b = arms.iter().find(|arm| arm["name"] == "b").unwrap();
    assert!((b["alpha"].as_f64().unwrap() - 1.0).abs() < 1e-9);
}

#[test]
fn test_mode_switch_keeps_learned_state() {
    let mut bandit = StrategyBandit::new(&["a", "b"], BanditMode::Ucb1);
    for _ in 0..30 {
        bandit.record_reward("a", 0.95, None);
        bandit.record_reward("b", 0.05, None);
    }
    bandit.set_mode(BanditMode::Thompson);
    let mut wins = 0;
    for _ in 0..100 {
        if bandit.select_strategy(None) == "a" {
            wins += 1;
        }
    }
    assert!(wins > 80, "a selected only {}/100 times after mode switch", wins);
}

#[test]
fn test_linucb_round_trip_preserves_contextual_preference() {
    let mut bandit = StrategyBandit::new(&["solo", "fanout"], BanditMode::LinUcb);
    let small = StrategyContext::new(0.1, 0.1, 0.1, 0.1, 0.0);
    let big = StrategyContext::new(0.9, 0.9, 0.7, 0.6, 0.1);
    for _ in 0..50 {
        bandit.record_reward("solo", 0.9, Some(&small));
        bandit.record_reward("fanout", 0.2, Some(&small));
        bandit.record_reward("solo", 0.2, Some(&big));
        bandit.record_reward("fanout", 0.9, Some(&big));
    }

    let restored = StrategyBandit::deserialize(&bandit.serialize()).unwrap();
    assert_eq!(restored.select_strategy(Some(&small)), "solo");
    assert_eq!(restored.select_strategy(Some(&big)), "fanout");
}
