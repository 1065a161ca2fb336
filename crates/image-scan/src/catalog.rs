//! 핵심 바이너리 카탈로그 -- 런타임 식별용 고정 경로 목록
//!
//! 패키지 메타데이터 없이 설치된 언어 런타임을 식별하기 위해 잘 알려진
//! 실행 파일 경로의 콘텐츠 해시를 수집합니다. 카탈로그의 선언 순서가
//! 곧 해시 보고 순서입니다. 순서는 다운스트림 소비자와의 계약이므로
//! 항목을 추가할 때는 반드시 목록 끝에 붙여야 합니다.

/// 런타임 하나의 카탈로그 항목
#[derive(Debug, Clone, Copy)]
pub struct KeyBinary {
    /// 플러그인 키 (ScanResult 맵의 키가 됩니다)
    pub plugin_key: &'static str,
    /// 이미지 루트 기준 상대 경로 목록 (선언 순서 = 해시 순서)
    pub paths: &'static [&'static str],
}

/// 고정 카탈로그. 순서 변경 금지.
pub const KEY_BINARIES: &[KeyBinary] = &[
    KeyBinary {
        plugin_key: "node",
        paths: &[
            "usr/local/bin/node",
            "usr/bin/node",
            "usr/bin/nodejs",
        ],
    },
    KeyBinary {
        plugin_key: "openjdk",
        paths: &[
            "usr/local/openjdk-8/bin/java",
            "usr/local/openjdk-11/bin/java",
            "usr/local/openjdk-17/bin/java",
            "usr/local/openjdk-21/bin/java",
            "opt/java/openjdk/bin/java",
            "usr/lib/jvm/default-jvm/bin/java",
            "usr/bin/java",
        ],
    },
    KeyBinary {
        plugin_key: "python",
        paths: &[
            "usr/local/bin/python3",
            "usr/bin/python3",
            "usr/local/bin/python",
            "usr/bin/python",
        ],
    },
];
